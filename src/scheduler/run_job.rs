use std::{sync::Arc, time::Instant};

use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    context::Context,
    dumper::{self, DumpError},
    pipeline,
    spec::BackupSpec,
    webhook::{NotificationPayload, Notifier},
    writer::{self, BackupMetadata},
};

/// Execute one backup invocation end to end: pre-flight, pipeline, sidecar
/// or partial cleanup, notification.
///
/// Operational errors land in the payload and the logs, never in the return
/// value: the tick loop must always see the job as finished so the
/// skip-if-running gate is freed. The guard and permit are held until this
/// function returns.
pub(crate) async fn run_job(
    config: Arc<Config>,
    notifier: Arc<Notifier>,
    spec: BackupSpec,
    cancel: CancellationToken,
    _running: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
) {
    let start = Instant::now();
    let started_at = Utc::now();

    let mut context = Context::for_spec(&spec);
    context.stage = "Backup";
    info!("{context}Starting {} backup", spec.kind);

    let mut payload = NotificationPayload {
        container_id: spec.container_id.clone(),
        container_name: spec.container_name.clone(),
        database_type: spec.kind.to_string(),
        database_name: spec.database.clone(),
        destination_url: String::new(),
        success: false,
        error: None,
        backup_size_bytes: None,
        duration_seconds: 0.0,
        timestamp: started_at,
        cron_schedule: Some(spec.cron.clone()),
        backup_prefix: if spec.prefix.is_empty() {
            None
        } else {
            Some(spec.prefix.clone())
        },
        destination_type: None,
    };

    // A watchdog enforces the per-job deadline through the shared token.
    let watchdog = tokio::spawn({
        let cancel = cancel.clone();
        let deadline = config.backup_timeout;
        async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    warn!("Backup deadline of {deadline:?} reached, cancelling job");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        }
    });

    let dumper = dumper::for_kind(spec.kind);

    context.stage = "Preflight";
    let preflight = tokio::select! {
        result = dumper.test_connection(&spec) => result,
        _ = cancel.cancelled() => Err(DumpError::Cancelled),
    };

    if let Err(dump_error) = preflight {
        error!("{context}Connection test failed: {dump_error}");
        watchdog.abort();
        payload.error = Some(format!("connection test failed: {dump_error}"));
        payload.duration_seconds = start.elapsed().as_secs_f64();
        notifier.enqueue(payload, &spec);
        return;
    }

    let backup_writer = match writer::for_spec(&spec, &config).await {
        Ok(backup_writer) => backup_writer,
        Err(write_error) => {
            error!("{context}Failed to get writer for {}: {write_error}", spec.dest);
            watchdog.abort();
            payload.error = Some(format!("failed to get writer: {write_error}"));
            payload.duration_seconds = start.elapsed().as_secs_f64();
            notifier.enqueue(payload, &spec);
            return;
        }
    };
    payload.destination_type = Some(backup_writer.kind().to_owned());

    let object_name = writer::object_name(&spec, Utc::now());

    context.stage = "Pipeline";
    let report = pipeline::run(
        &cancel,
        Arc::clone(&dumper),
        Arc::clone(&backup_writer),
        &spec,
        &object_name,
    )
    .await;
    watchdog.abort();

    let duration_seconds = start.elapsed().as_secs_f64();
    payload.duration_seconds = duration_seconds;
    payload.success = report.success();

    if let Some(receipt) = &report.receipt {
        payload.backup_size_bytes = Some(receipt.bytes_written);
        payload.destination_url = receipt.destination.clone();
    }

    match (&report.receipt, report.success()) {
        (Some(receipt), true) => {
            let metadata = BackupMetadata {
                timestamp: started_at,
                container_id: spec.container_id.clone(),
                container_name: spec.container_name.clone(),
                database_type: spec.kind.to_string(),
                database_name: spec.database.clone(),
                backup_size_bytes: receipt.bytes_written,
                checksum: receipt.checksum.clone(),
                compression_type: "gzip".to_owned(),
                version: "1.0".to_owned(),
                destination: receipt.destination.clone(),
                duration_seconds,
                success: true,
                error: None,
            };

            context.stage = "Metadata";
            if let Err(metadata_error) =
                writer::write_metadata(backup_writer.as_ref(), &metadata, &object_name).await
            {
                warn!("{context}Failed to write backup metadata: {metadata_error}");
            }

            info!(
                "{context}Backup completed: {} ({} bytes, sha256 {}) in {duration_seconds:.2}s",
                receipt.destination, receipt.bytes_written, receipt.checksum,
            );
        }
        _ => {
            let message = report.error_message();
            payload.error = Some(message.clone());
            error!("{context}Backup failed: {message}");

            // The object may hold partial bytes; deleting an absent key is a
            // success, so clean up unconditionally.
            context.stage = "Cleanup";
            match backup_writer.delete_object(&object_name).await {
                Ok(()) => info!("{context}Cleaned up partial backup {object_name}"),
                Err(delete_error) => {
                    warn!("{context}Failed to clean up partial backup {object_name}: {delete_error}")
                }
            }
        }
    }

    notifier.enqueue(payload, &spec);
}
