//! Retention sweeps.
//!
//! A daily timer (04:00 in the host's local timezone) walks the registry and
//! deletes every stored object older than the spec's effective retention.
//! Per-object failures are counted but never abort a sweep.

use core::time::Duration;
use std::{str::FromStr, sync::Arc};

use chrono::{Local, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{current, SharedConfig},
    discovery::Watcher,
    spec::BackupSpec,
    writer::{self, BackupWriter, WriteError},
};

/// Local time of day the daily sweep fires, as a seconds-based cron line.
const DAILY_SCHEDULE: &str = "0 0 4 * * *";

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between deletions so a large sweep cannot pound the backend.
const DELETE_INTERVAL: Duration = Duration::from_millis(100);

/// What a sweep did, or would have done in dry-run mode.
#[derive(Debug, Default, Clone)]
pub struct GcSummary {
    /// Objects considered under the prefix.
    pub considered: usize,
    /// Objects deleted, or counted as would-delete in dry-run mode.
    pub affected: usize,
    /// Per-object delete failures.
    pub failed: usize,
    /// Bytes freed, or reclaimable in dry-run mode.
    pub bytes_affected: u64,
}

/// Sweeps one spec's prefix against its effective retention.
pub struct GcRunner {
    spec: BackupSpec,
    backup_writer: Arc<dyn BackupWriter>,
    effective_retention: Duration,
    dry_run: bool,
}

impl GcRunner {
    /// Create a runner. The effective retention is the spec's when positive,
    /// otherwise the global default; if both are zero the runner no-ops.
    pub fn new(
        spec: BackupSpec,
        backup_writer: Arc<dyn BackupWriter>,
        global_retention: Duration,
        dry_run: bool,
    ) -> Self {
        let effective_retention = if spec.retention > Duration::ZERO {
            spec.retention
        } else {
            global_retention
        };

        Self {
            spec,
            backup_writer,
            effective_retention,
            dry_run,
        }
    }

    /// Run the sweep.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<GcSummary, GcError> {
        if self.effective_retention.is_zero() {
            debug!(
                "GC: skipping {}: effective retention is not positive",
                self.spec.container_id
            );
            return Ok(GcSummary::default());
        }

        info!(
            "GC: sweeping prefix '{}' for {} (retention {:?}, dry run {})",
            self.spec.prefix, self.spec.container_name, self.effective_retention, self.dry_run,
        );

        let objects = tokio::time::timeout(
            LIST_TIMEOUT,
            self.backup_writer.list_objects(&self.spec.prefix),
        )
        .await
        .map_err(|_| GcError::ListTimeout(LIST_TIMEOUT))?
        .map_err(GcError::List)?;

        let mut summary = GcSummary {
            considered: objects.len(),
            ..GcSummary::default()
        };

        if objects.is_empty() {
            debug!("GC: no objects under prefix '{}'", self.spec.prefix);
            return Ok(summary);
        }

        let retention = chrono::Duration::from_std(self.effective_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - retention;

        for object in objects {
            if cancel.is_cancelled() {
                warn!("GC: sweep cancelled during object iteration");
                return Err(GcError::Cancelled);
            }

            if object.last_modified >= cutoff {
                continue;
            }

            if self.dry_run {
                info!(
                    "GC: [dry run] would delete {} ({} bytes, last modified {})",
                    object.key, object.size, object.last_modified,
                );
                summary.affected += 1;
                summary.bytes_affected += object.size;
                continue;
            }

            let deleted = tokio::time::timeout(
                DELETE_TIMEOUT,
                self.backup_writer.delete_object(&object.key),
            )
            .await;

            match deleted {
                Ok(Ok(())) => {
                    info!("GC: deleted {} ({} bytes)", object.key, object.size);
                    summary.affected += 1;
                    summary.bytes_affected += object.size;
                }
                Ok(Err(delete_error)) => {
                    error!("GC: failed to delete {}: {delete_error}", object.key);
                    summary.failed += 1;
                }
                Err(_) => {
                    error!(
                        "GC: deleting {} timed out after {DELETE_TIMEOUT:?}",
                        object.key
                    );
                    summary.failed += 1;
                }
            }

            tokio::time::sleep(DELETE_INTERVAL).await;
        }

        let status = if self.dry_run {
            "would be freed (dry run)"
        } else {
            "freed"
        };
        info!(
            "GC: sweep of '{}' finished: {} of {} objects affected, {} bytes {status}, {} failures",
            self.spec.prefix,
            summary.affected,
            summary.considered,
            summary.bytes_affected,
            summary.failed,
        );

        if summary.failed > 0 {
            return Err(GcError::DeletesFailed {
                failed: summary.failed,
                summary,
            });
        }

        Ok(summary)
    }
}

/// Run the daily sweep loop until cancelled. The 04:00 schedule is evaluated
/// in the host's local timezone.
pub async fn run_daily(watcher: Arc<Watcher>, config: SharedConfig, cancel: CancellationToken) {
    let schedule = Schedule::from_str(DAILY_SCHEDULE).expect("daily GC schedule is valid");

    info!("Nightly GC scheduled for 04:00 local time");

    loop {
        let now = Local::now();
        let Some(next) = schedule.after(&now).next() else {
            return;
        };

        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        sweep_all(&watcher, &config, &cancel).await;
    }
}

/// Sweep every enabled spec in the registry once.
pub async fn sweep_all(watcher: &Watcher, config: &SharedConfig, cancel: &CancellationToken) {
    info!("Starting global garbage collection run...");

    let registry = watcher.registry_snapshot();
    if registry.is_empty() {
        info!("GC: no active backup specifications, nothing to do");
        return;
    }

    let config = current(config);

    for (container_id, spec) in registry {
        if cancel.is_cancelled() {
            info!("Global GC run cancelled");
            return;
        }

        if !spec.enabled {
            continue;
        }

        let backup_writer = match writer::for_spec(&spec, &config).await {
            Ok(backup_writer) => backup_writer,
            Err(write_error) => {
                error!("GC: failed to get writer for {container_id}: {write_error}");
                continue;
            }
        };

        let runner = GcRunner::new(
            spec,
            backup_writer,
            config.global_retention,
            config.gc_dry_run,
        );

        if let Err(gc_error) = runner.run(cancel).await {
            error!("GC: sweep failed for {container_id}: {gc_error}");
        }
    }

    info!("Global garbage collection run finished");
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum GcError {
    #[error("Failed to list objects:\n{0}")]
    List(#[source] WriteError),

    #[error("Listing objects timed out after {0:?}")]
    ListTimeout(Duration),

    #[error("{failed} deletions failed during the sweep")]
    DeletesFailed { failed: usize, summary: GcSummary },

    #[error("Sweep cancelled")]
    Cancelled,
}
