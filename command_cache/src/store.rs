//! Durable key-value storage for command results.
//!
//! The store keeps every entry in memory and serves reads from there. Each
//! write rewrites the whole map to disk while holding the write lock, so the
//! file always matches the map once `set` returns successfully.
//!
//! Writes go to a sibling `<file>.tmp` first, are flushed with `fsync` and then
//! renamed over the target. A crash in the middle of a write leaves the
//! previous file intact next to a stale temp file, which `open` ignores.

use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;

/// Key-value map from command key to result.
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up a stored result. Never triggers computation.
    async fn get(&self, key: &str) -> Option<String>;

    /// Insert a result and make it durable before returning.
    ///
    /// On error the entry may already be visible through [`Store::get`].
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Number of stored entries.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// JSON file backed store.
pub struct FileStore {
    path: PathBuf,
    data: RwLock<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, loading existing entries.
    ///
    /// A missing file yields an empty store. A file that exists but cannot be
    /// parsed is reported as [`StoreError::CorruptState`].
    #[instrument]
    pub async fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<HashMap<String, String>>(&bytes).map_err(
                |source| StoreError::CorruptState {
                    path: path.clone(),
                    source,
                },
            )?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No store file at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(source) => {
                return Err(StoreError::Load {
                    path: path.clone(),
                    source,
                })
            }
        };

        let temp = temp_path(&path);
        if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            warn!(
                "Ignoring leftover temp file {} from an interrupted write",
                temp.display()
            );
        }

        info!("Loaded {} entries from {}", data.len(), path.display());
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full snapshot to disk. Callers hold the write lock.
    async fn persist(&self, snapshot: &HashMap<String, String>) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(snapshot).map_err(StoreError::Encode)?;
        let temp = temp_path(&self.path);

        let result = self.write_and_swap(&temp, &payload).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&temp).await {
                debug!("Could not remove temp file {}: {}", temp.display(), e);
            }
        }
        result.map_err(|source| StoreError::Persistence {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_and_swap(&self, temp: &Path, payload: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(temp).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(temp, &self.path).await
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.data.read().await.get(key).cloned()
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value);
        self.persist(&data).await?;
        debug!("Persisted {} entries to {}", data.len(), self.path.display());
        Ok(())
    }

    async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}

/// Non-durable store with the same locking discipline as [`FileStore`].
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.data.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("store"));
    name.push(".tmp");
    path.with_file_name(name)
}
