use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::storage::{ListableStorage, StorageClient};
use crate::error::StorageError;

const PARTIAL_SUFFIX: &str = ".part";

/// Storage target backed by a directory (local disk, NFS or SMB mount, ...).
///
/// Uploads are copied to `<name>.part`, checked against the source with
/// BLAKE3 and only then renamed into place, so a listing never sees a
/// half-written archive.
pub struct DirectoryStorage {
    root: PathBuf,
    create: bool,
    connected: bool,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>, create: bool) -> Self {
        Self {
            root: root.into(),
            create,
            connected: false,
        }
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.connected {
            Ok(())
        } else {
            Err(StorageError::NotConnected)
        }
    }

    fn entry(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

#[async_trait]
impl StorageClient for DirectoryStorage {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn connect(&mut self) -> Result<(), StorageError> {
        if !tokio::fs::try_exists(&self.root).await? {
            if !self.create {
                return Err(StorageError::NotFound(self.root.display().to_string()));
            }
            tokio::fs::create_dir_all(&self.root).await?;
        }
        if !tokio::fs::metadata(&self.root).await?.is_dir() {
            return Err(StorageError::Other(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        self.connected = false;
        Ok(())
    }

    async fn upload(&mut self, path: &Path) -> Result<(), StorageError> {
        self.ensure_connected()?;

        let name = path
            .file_name()
            .ok_or_else(|| StorageError::NotFound(path.display().to_string()))?;
        let destination = self.root.join(name);
        let mut partial = destination.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        let result = store(path, &partial, &destination).await;
        if result.is_err() {
            remove_partial(&partial).await;
        }
        result
    }

    fn as_listable(&mut self) -> Option<&mut dyn ListableStorage> {
        Some(self)
    }
}

#[async_trait]
impl ListableStorage for DirectoryStorage {
    async fn find(&mut self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_connected()?;

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(prefix) && !name.ends_with(PARTIAL_SUFFIX) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn size(&mut self, id: &str) -> Result<u64, StorageError> {
        Ok(tokio::fs::metadata(self.entry(id)).await?.len())
    }

    async fn modified_at(&mut self, id: &str) -> Result<DateTime<Utc>, StorageError> {
        let modified = tokio::fs::metadata(self.entry(id)).await?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    async fn delete(&mut self, id: &str) -> Result<(), StorageError> {
        self.ensure_connected()?;
        tokio::fs::remove_file(self.entry(id)).await?;
        Ok(())
    }
}

/// Copies `source` to `partial`, verifies it and renames it to `destination`.
/// The caller removes `partial` on error.
async fn store(source: &Path, partial: &Path, destination: &Path) -> Result<(), StorageError> {
    let bytes = tokio::fs::copy(source, partial).await?;
    debug!(source = %source.display(), partial = %partial.display(), bytes, "Copied archive");

    let original = source.to_path_buf();
    let copy = partial.to_path_buf();
    let matches = tokio::task::spawn_blocking(move || -> io::Result<bool> {
        Ok(hash_file(&original)? == hash_file(&copy)?)
    })
    .await
    .map_err(|e| StorageError::Other(format!("verification task failed: {e}")))??;

    if !matches {
        return Err(StorageError::Checksum(destination.display().to_string()));
    }

    tokio::fs::rename(partial, destination).await?;
    Ok(())
}

async fn remove_partial(partial: &Path) {
    if let Err(e) = tokio::fs::remove_file(partial).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(partial = %partial.display(), error = %e, "Failed to remove partial upload");
        }
    }
}

fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}
