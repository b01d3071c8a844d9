//! Backup destinations.
//!
//! A writer streams an opaque backup object to a destination, computing the
//! SHA-256 of exactly the bytes it consumed, and supports the listing and
//! deletion the garbage collector needs.

use core::time::Duration;
use std::{io, path::Path, pin::Pin, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::{
    config::Config,
    pipeline::BackupStream,
    spec::{BackupSpec, Destination},
};

mod local;
mod metadata;
mod s3;

pub use local::LocalWriter;
pub use metadata::{metadata_key, read_metadata, write_metadata, BackupMetadata, MetadataError};
pub use s3::S3Writer;

/// A stored backup object.
#[derive(Debug, Clone)]
pub struct BackupObjectMeta {
    /// The object key, relative to the destination root.
    pub key: String,
    /// When the object was last written.
    pub last_modified: DateTime<Utc>,
    /// Object size in bytes.
    pub size: u64,
    /// Stored checksum, where the backend provides one.
    pub checksum: Option<String>,
}

/// The result of a successful write.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    /// Full locator of the stored object.
    pub destination: String,
    /// Bytes consumed from the stream and stored.
    pub bytes_written: u64,
    /// Lowercase hex SHA-256 of those bytes.
    pub checksum: String,
}

/// A backup destination.
#[async_trait]
pub trait BackupWriter: Send + Sync {
    /// Stream a backup object to the destination.
    async fn write(
        &self,
        object_name: &str,
        stream: &mut BackupStream,
    ) -> Result<WriteReceipt, WriteError>;

    /// List objects under a prefix.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObjectMeta>, WriteError>;

    /// Open a stored object for reading.
    async fn read_object(
        &self,
        object_name: &str,
    ) -> Result<Pin<Box<dyn AsyncRead + Send>>, WriteError>;

    /// Delete an object. Deleting a key that does not exist is a success.
    async fn delete_object(&self, key: &str) -> Result<(), WriteError>;

    /// The kind tag, `"local"` or `"s3"`.
    fn kind(&self) -> &'static str;
}

/// Build the writer for a spec's destination.
pub async fn for_spec(
    spec: &BackupSpec,
    config: &Config,
) -> Result<Arc<dyn BackupWriter>, WriteError> {
    match spec.dest {
        Destination::Local => Ok(Arc::new(LocalWriter::new(&config.local_backup_path)?)),
        Destination::Remote => Ok(Arc::new(S3Writer::new(&config.s3).await?)),
    }
}

/// Build the object key for a backup taken at `now`:
/// `<prefix>/<kind>-<db>-<YYYYMMDDhhmmss>.dump.gz`.
///
/// The database component comes from the spec's database, falling back to the
/// trailing segment of the connection URI, then to `"default"`. Characters
/// outside `[A-Za-z0-9.-]` are replaced with underscores.
pub fn object_name(spec: &BackupSpec, now: DateTime<Utc>) -> String {
    let db_part = match &spec.database {
        Some(database) => database.clone(),
        None => {
            let tail = spec.conn.rsplit('/').next().unwrap_or("");
            let tail = tail.split('?').next().unwrap_or("");
            if tail.is_empty() || tail == spec.conn {
                "default".to_owned()
            } else {
                tail.to_owned()
            }
        }
    };

    let db_part: String = db_part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let file_name = format!(
        "{}-{}-{}.dump.gz",
        spec.kind,
        db_part,
        now.format("%Y%m%d%H%M%S")
    );

    if spec.prefix.is_empty() {
        file_name
    } else {
        format!("{}/{}", spec.prefix, file_name)
    }
}

/// Fail when the filesystem holding `path` has less than 10% free space.
#[cfg(unix)]
pub fn check_disk_space(path: &Path) -> Result<(), WriteError> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| WriteError::DiskSpace("path contains a NUL byte".to_owned()))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(WriteError::DiskSpace(format!(
            "failed to get filesystem stats for {}: {}",
            path.display(),
            io::Error::last_os_error()
        )));
    }

    if stat.f_blocks == 0 {
        return Err(WriteError::DiskSpace(
            "invalid filesystem: total blocks is 0".to_owned(),
        ));
    }

    let free_percentage = stat.f_bavail as f64 / stat.f_blocks as f64 * 100.0;
    if free_percentage < 10.0 {
        return Err(WriteError::DiskSpace(format!(
            "insufficient disk space: {free_percentage:.2}% free (minimum 10% required)"
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn check_disk_space(_path: &Path) -> Result<(), WriteError> {
    Ok(())
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Disk space check failed: {0}")]
    DiskSpace(String),

    #[error("Object key escapes the backup root: {0}")]
    PathTraversal(String),

    #[error("Failed to create directory:\n{0}")]
    CreateDirectory(#[source] io::Error),

    #[error("Failed to create backup file:\n{0}")]
    CreateFile(#[source] io::Error),

    #[error("Failed to write backup data:\n{0}")]
    Io(#[source] io::Error),

    #[error("Failed to read object:\n{0}")]
    Read(#[source] io::Error),

    #[error("Failed to delete object:\n{0}")]
    Delete(#[source] io::Error),

    #[error("Failed to list objects:\n{0}")]
    List(String),

    #[error("The dump stream failed:\n{0}")]
    Source(String),

    #[error("S3 bucket name is not configured (BUCKET_NAME)")]
    MissingBucket,

    #[error("S3 bucket '{bucket}' does not exist or is not accessible:\n{error}")]
    BucketUnreachable { bucket: String, error: String },

    #[error("S3 request failed:\n{0}")]
    S3(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Write cancelled")]
    Cancelled,

    #[error("Write worker failed:\n{0}")]
    Worker(String),
}
