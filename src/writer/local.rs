use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    pin::Pin,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, error, info};

use crate::pipeline::BackupStream;

use super::{check_disk_space, BackupObjectMeta, BackupWriter, WriteError, WriteReceipt};

/// Writes backups to a directory tree rooted at a base path.
pub struct LocalWriter {
    base_path: PathBuf,
}

impl LocalWriter {
    /// Create a local writer rooted at `base_path`, creating the directory if
    /// needed. Fails when the filesystem is low on space.
    pub fn new(base_path: &Path) -> Result<Self, WriteError> {
        std::fs::create_dir_all(base_path).map_err(WriteError::CreateDirectory)?;
        check_disk_space(base_path)?;

        // The containment check in resolve compares against the canonical base.
        let base_path = base_path
            .canonicalize()
            .map_err(WriteError::CreateDirectory)?;

        Ok(Self { base_path })
    }

    /// Resolve an object key to a path under the base, refusing keys that
    /// would escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, WriteError> {
        let key = key.replace('\\', "/");
        let relative = Path::new(&key);

        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::RootDir));
        if escapes {
            error!("Malformed object key, potential path traversal: {key}");
            return Err(WriteError::PathTraversal(key));
        }

        let target = self.base_path.join(relative);

        if !target.starts_with(&self.base_path) {
            return Err(WriteError::PathTraversal(key));
        }

        Ok(target)
    }
}

#[async_trait]
impl BackupWriter for LocalWriter {
    async fn write(
        &self,
        object_name: &str,
        stream: &mut BackupStream,
    ) -> Result<WriteReceipt, WriteError> {
        check_disk_space(&self.base_path)?;

        let file_path = self.resolve(object_name)?;

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(WriteError::CreateDirectory)?;
        }

        let mut file = fs::File::create(&file_path)
            .await
            .map_err(WriteError::CreateFile)?;

        let mut hasher = Sha256::new();
        let mut bytes_written = 0u64;

        let remove_partial = |path: PathBuf| async move {
            if let Err(error) = fs::remove_file(&path).await {
                if error.kind() != ErrorKind::NotFound {
                    error!("Failed to remove partial backup file {path:?}: {error}");
                }
            }
        };

        loop {
            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(error) => {
                    drop(file);
                    remove_partial(file_path).await;
                    return Err(WriteError::Source(error.to_string()));
                }
            };

            hasher.update(&chunk);

            if let Err(error) = file.write_all(&chunk).await {
                drop(file);
                remove_partial(file_path).await;
                return Err(WriteError::Io(error));
            }

            bytes_written += chunk.len() as u64;
        }

        file.flush().await.map_err(WriteError::Io)?;

        let checksum = hex::encode(hasher.finalize());
        info!(
            "Wrote local backup {file_path:?} ({bytes_written} bytes, sha256 {checksum})"
        );

        Ok(WriteReceipt {
            destination: file_path.to_string_lossy().into_owned(),
            bytes_written,
            checksum,
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObjectMeta>, WriteError> {
        let prefix = prefix.trim_matches('/');
        let scan_path = if prefix.is_empty() {
            self.base_path.clone()
        } else {
            self.resolve(prefix)?
        };

        match fs::metadata(&scan_path).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                debug!("List path {scan_path:?} is a file, returning empty list");
                return Ok(Vec::new());
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("List path {scan_path:?} does not exist, returning empty list");
                return Ok(Vec::new());
            }
            Err(error) => return Err(WriteError::List(error.to_string())),
        }

        let mut objects = Vec::new();
        let mut pending = vec![scan_path];

        while let Some(directory) = pending.pop() {
            let mut entries = fs::read_dir(&directory)
                .await
                .map_err(|error| WriteError::List(error.to_string()))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|error| WriteError::List(error.to_string()))?
            {
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(error) => {
                        debug!("Could not get metadata for {path:?}: {error}");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let key = relative.to_string_lossy().replace('\\', "/");

                let last_modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                objects.push(BackupObjectMeta {
                    key,
                    last_modified,
                    size: metadata.len(),
                    checksum: None,
                });
            }
        }

        Ok(objects)
    }

    async fn read_object(
        &self,
        object_name: &str,
    ) -> Result<Pin<Box<dyn AsyncRead + Send>>, WriteError> {
        let file_path = self.resolve(object_name)?;

        let file = fs::File::open(&file_path).await.map_err(WriteError::Read)?;

        Ok(Box::pin(file))
    }

    async fn delete_object(&self, key: &str) -> Result<(), WriteError> {
        let file_path = self.resolve(key)?;

        match fs::remove_file(&file_path).await {
            Ok(()) => {
                info!("Deleted local backup {file_path:?}");
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("Local file {file_path:?} not found for deletion, treating as success");
                Ok(())
            }
            Err(error) => Err(WriteError::Delete(error)),
        }
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
