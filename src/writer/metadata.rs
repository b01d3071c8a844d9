use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::pipeline::BackupStream;

use super::{BackupWriter, WriteError};

/// The sidecar describing a stored backup, written to
/// `<backup-key>.metadata.json` after a successful write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub container_id: String,
    pub container_name: String,
    pub database_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    pub backup_size_bytes: u64,
    pub checksum: String,
    pub compression_type: String,
    pub version: String,
    pub destination: String,
    pub duration_seconds: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The sidecar key for a backup object.
pub fn metadata_key(object_name: &str) -> String {
    format!("{object_name}.metadata.json")
}

/// Write the sidecar for a stored backup.
pub async fn write_metadata(
    writer: &dyn BackupWriter,
    metadata: &BackupMetadata,
    object_name: &str,
) -> Result<(), MetadataError> {
    let key = metadata_key(object_name);

    let json = serde_json::to_vec_pretty(metadata)?;
    let mut stream = BackupStream::from_bytes(json);

    writer.write(&key, &mut stream).await?;

    debug!("Wrote backup metadata {key}");
    Ok(())
}

/// Read the sidecar for a stored backup.
pub async fn read_metadata(
    writer: &dyn BackupWriter,
    object_name: &str,
) -> Result<BackupMetadata, MetadataError> {
    let key = metadata_key(object_name);

    let mut reader = writer.read_object(&key).await?;
    let mut contents = Vec::new();
    reader
        .read_to_end(&mut contents)
        .await
        .map_err(|error| MetadataError::Write(WriteError::Read(error)))?;

    Ok(serde_json::from_slice(&contents)?)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to serialize metadata:\n{0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write metadata file:\n{0}")]
    Write(#[from] WriteError),
}
