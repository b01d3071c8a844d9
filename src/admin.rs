//! Admin HTTP endpoints: liveness, readiness, status, and sidecar lookup.

use core::time::Duration;
use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::{current, SharedConfig},
    discovery::Watcher,
    writer::{self, check_disk_space},
};

const READYZ_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// State shared with the handlers.
#[derive(Clone)]
pub struct AdminState {
    pub watcher: Arc<Watcher>,
    pub config: SharedConfig,
}

/// Serve the admin endpoints until cancelled, then shut down within a fixed
/// deadline.
pub async fn serve(
    state: AdminState,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), AdminError> {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/metadata", get(metadata))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(AdminError::Bind)?;

    info!("Serving admin endpoints on {addr}");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    tokio::select! {
        result = async move { server.await } => result.map_err(AdminError::Serve)?,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        } => {
            info!("Admin server shutdown deadline of {SHUTDOWN_DEADLINE:?} reached");
        }
    }

    info!("Admin server stopped");
    Ok(())
}

/// Liveness. Unaffected by transient failures.
async fn healthz() -> &'static str {
    debug!("Health check");
    "ok"
}

/// Readiness: the runtime must answer a ping and the local writer's
/// filesystem must have free space.
async fn readyz(State(state): State<AdminState>) -> Response {
    let mut checks = Vec::new();
    let mut healthy = true;

    let ping = tokio::time::timeout(READYZ_TIMEOUT, state.watcher.ping()).await;
    match ping {
        Ok(Ok(())) => checks.push("Runtime: OK".to_owned()),
        Ok(Err(error)) => {
            checks.push(format!("Runtime: {error}"));
            healthy = false;
        }
        Err(_) => {
            checks.push(format!("Runtime: ping timed out after {READYZ_TIMEOUT:?}"));
            healthy = false;
        }
    }

    let config = current(&state.config);
    match check_disk_space(&config.local_backup_path) {
        Ok(()) => checks.push("Disk: OK".to_owned()),
        Err(error) => {
            checks.push(format!("Disk: {error}"));
            healthy = false;
        }
    }

    if config.s3.bucket.is_some() {
        checks.push("S3: OK".to_owned());
    }

    let body = checks.join("\n");
    if healthy {
        (StatusCode::OK, format!("ready\n{body}")).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, format!("not ready\n{body}")).into_response()
    }
}

/// The current registry, as JSON.
async fn status(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let registry = state.watcher.registry_snapshot();

    let containers: Vec<serde_json::Value> = registry
        .iter()
        .map(|(container_id, spec)| {
            serde_json::json!({
                "container_id": container_id,
                "container_name": spec.container_name,
                "database_type": spec.kind,
                "database_name": spec.database,
                "cron_schedule": spec.cron,
                "destination": spec.dest,
                "retention_seconds": spec.retention.as_secs(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "active_specs": registry.len(),
        "containers": containers,
    }))
}

#[derive(Deserialize)]
struct MetadataQuery {
    object: String,
}

/// The metadata sidecar for a stored object.
async fn metadata(
    State(state): State<AdminState>,
    Query(query): Query<MetadataQuery>,
) -> Response {
    let registry = state.watcher.registry_snapshot();

    // Any registered spec identifies the destination to read from.
    let Some(spec) = registry.values().next() else {
        return (StatusCode::NOT_FOUND, "no containers registered").into_response();
    };

    let config = current(&state.config);
    let backup_writer = match writer::for_spec(spec, &config).await {
        Ok(backup_writer) => backup_writer,
        Err(write_error) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to get writer: {write_error}"),
            )
                .into_response();
        }
    };

    match writer::read_metadata(backup_writer.as_ref(), &query.object).await {
        Ok(metadata) => Json(metadata).into_response(),
        Err(metadata_error) => (
            StatusCode::NOT_FOUND,
            format!("failed to read metadata: {metadata_error}"),
        )
            .into_response(),
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Failed to bind admin listener:\n{0}")]
    Bind(#[source] io::Error),

    #[error("Admin server failed:\n{0}")]
    Serve(#[source] io::Error),
}
