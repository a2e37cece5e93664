//! Process-local blob store for job inputs and outputs.
//!
//! Jobs never carry bytes, only a [`BlobRef`]. Memory blobs live in a
//! `DashMap`; when a spill directory is configured, new blobs are written
//! there as files instead. `file:` references supplied by callers are read
//! in place and never deleted.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use dashmap::DashMap;
use mf_core::config::StorageConfig;
use mf_core::{BlobId, BlobRef, Error, Result};

pub struct BlobStore {
    memory: DashMap<BlobId, Bytes>,
    spill_dir: Option<PathBuf>,
}

impl BlobStore {
    pub fn in_memory() -> Self {
        Self {
            memory: DashMap::new(),
            spill_dir: None,
        }
    }

    /// Store new blobs as files under `dir`, creating it if needed.
    pub fn with_spill_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            memory: DashMap::new(),
            spill_dir: Some(dir),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match &config.spill_dir {
            Some(dir) => Self::with_spill_dir(dir.clone()),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn spill_dir(&self) -> Option<&Path> {
        self.spill_dir.as_deref()
    }

    /// Number of blobs held in memory.
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub async fn put(&self, bytes: Bytes) -> Result<BlobRef> {
        let id = BlobId::new();
        match &self.spill_dir {
            Some(dir) => {
                let path = dir.join(format!("{id}.blob"));
                tokio::fs::write(&path, &bytes).await?;
                Ok(BlobRef::File(path))
            }
            None => {
                self.memory.insert(id, bytes);
                Ok(BlobRef::Memory(id))
            }
        }
    }

    pub async fn read(&self, blob: &BlobRef) -> Result<Bytes> {
        match blob {
            BlobRef::Memory(id) => self
                .memory
                .get(id)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::not_found("blob", blob)),
            BlobRef::File(path) => match tokio::fs::read(path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(Error::not_found("blob", blob))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Release a blob this store owns. Files outside the spill directory
    /// are left alone.
    pub async fn remove(&self, blob: &BlobRef) {
        match blob {
            BlobRef::Memory(id) => {
                self.memory.remove(id);
            }
            BlobRef::File(path) => {
                if !self.owns(path) {
                    return;
                }
                if let Err(e) = tokio::fs::remove_file(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove blob file");
                    }
                }
            }
        }
    }

    fn owns(&self, path: &Path) -> bool {
        self.spill_dir
            .as_deref()
            .is_some_and(|dir| path.starts_with(dir))
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
