//! Database dumpers.
//!
//! Each dumper runs the external dump tool for its database kind, streaming
//! the tool's stdout into the pipeline sink. Credentials travel through the
//! child's environment, never on the command line, and are masked in logs.

use std::{io, process::Stdio, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    pipeline::{DumpSink, SinkError},
    spec::{BackupSpec, DbKind},
};

mod mongodb;
mod mysql;
mod postgres;
mod redis;

pub use mongodb::MongodbDumper;
pub use mysql::MysqlDumper;
pub use postgres::PostgresDumper;
pub use redis::RedisDumper;

/// A database-specific backup producer.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// Execute the dump, writing the raw output into the sink.
    async fn dump(
        &self,
        spec: &BackupSpec,
        sink: &mut DumpSink,
        cancel: &CancellationToken,
    ) -> Result<(), DumpError>;

    /// A cheap, side-effect-free connectivity check.
    async fn test_connection(&self, spec: &BackupSpec) -> Result<(), DumpError>;
}

/// The dumper for a database kind.
pub fn for_kind(kind: DbKind) -> Arc<dyn Dumper> {
    match kind {
        DbKind::Postgres => Arc::new(PostgresDumper),
        DbKind::Mysql => Arc::new(MysqlDumper),
        DbKind::Mongodb => Arc::new(MongodbDumper),
        DbKind::Redis => Arc::new(RedisDumper),
    }
}

/// Run a dump command, streaming its stdout into the sink and capturing
/// stderr for the error path.
pub(crate) async fn stream_command(
    mut command: Command,
    tool: &'static str,
    sink: &mut DumpSink,
    cancel: &CancellationToken,
) -> Result<(), DumpError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|source| DumpError::Spawn { tool, source })?;

    let Some(mut stdout) = child.stdout.take() else {
        return Err(DumpError::CapturePipe(tool));
    };
    let Some(mut stderr) = child.stderr.take() else {
        return Err(DumpError::CapturePipe(tool));
    };

    let stderr_task = tokio::spawn(async move {
        let mut output = Vec::new();
        let _ = stderr.read_to_end(&mut output).await;
        output
    });

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(DumpError::Cancelled);
            }
            read = stdout.read(&mut buffer) => {
                let count = read.map_err(DumpError::ReadStdout)?;
                if count == 0 {
                    break;
                }

                sink.write_all(&buffer[..count]).await.map_err(|error| match error {
                    SinkError::Closed => DumpError::SinkClosed,
                    SinkError::Compress(source) => DumpError::Compress(source),
                })?;
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stderr_task.abort();
            return Err(DumpError::Cancelled);
        }
        status = child.wait() => status.map_err(|source| DumpError::Spawn { tool, source })?,
    };

    let stderr_output = stderr_task.await.unwrap_or_default();
    let stderr_text = String::from_utf8_lossy(&stderr_output).trim().to_owned();

    if !status.success() {
        return Err(DumpError::CommandFailed {
            tool,
            status: status.to_string(),
            stderr: stderr_text,
        });
    }

    if !stderr_text.is_empty() {
        warn!("{tool} completed with messages on stderr:\n{stderr_text}");
    }

    Ok(())
}

/// Run a connectivity probe command, folding stderr into the error.
pub(crate) async fn run_probe(mut command: Command, tool: &'static str) -> Result<(), DumpError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = command
        .output()
        .await
        .map_err(|source| DumpError::Spawn { tool, source })?;

    if !output.status.success() {
        return Err(DumpError::ConnectionTest {
            tool,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(())
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("Invalid connection URI: {0}")]
    InvalidUri(String),

    #[error("No database specified in the URI path or backup.database label")]
    MissingDatabase,

    #[error("Failed to start {tool}:\n{source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to capture {0} output")]
    CapturePipe(&'static str),

    #[error("Failed to read dump output:\n{0}")]
    ReadStdout(#[source] io::Error),

    #[error("{tool} failed ({status}):\n{stderr}")]
    CommandFailed {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("Connection test failed for {tool}:\n{stderr}")]
    ConnectionTest {
        tool: &'static str,
        stderr: String,
    },

    #[error("The backup stream was closed by the writer")]
    SinkClosed,

    #[error("Failed to compress dump output:\n{0}")]
    Compress(#[source] io::Error),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Dump worker failed:\n{0}")]
    Worker(String),
}
