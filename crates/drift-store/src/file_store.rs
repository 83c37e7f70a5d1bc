//! File-based chunk blob backend.
//!
//! Stores one file per chunk with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use drift_types::ChunkHash;
use tracing::{debug, error};

use crate::atomic::write_atomic;
use crate::error::StoreError;
use crate::traits::{BlobStore, BlobUsage};

/// File-based blob store with 2-level fan-out directory layout.
///
/// Writes go through a uniquely named temp file and a rename, so a crash
/// or a concurrent writer never exposes a half-written chunk under its
/// final name. Reads re-hash the data and refuse corrupt chunks.
pub struct FileBlobStore {
    base_dir: PathBuf,
}

impl FileBlobStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// The root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Compute the full file path for a chunk hash.
    pub fn blob_path(&self, hash: &ChunkHash) -> PathBuf {
        let hex = hash.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    /// Walk the fan-out and return every well-named blob with its path.
    async fn walk(&self) -> Result<Vec<(ChunkHash, PathBuf)>, StoreError> {
        let mut found = Vec::new();

        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d1.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    // Leftover temp files fail to parse and are ignored.
                    if let Some(name) = entry.file_name().to_str()
                        && let Ok(hash) = name.parse::<ChunkHash>()
                    {
                        found.push((hash, entry.path()));
                    }
                }
            }
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, hash: ChunkHash, data: Bytes) -> Result<(), StoreError> {
        let path = self.blob_path(&hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let size = data.len();
        write_atomic(path.clone(), data).await?;

        debug!(%hash, path = %path.display(), size, "stored chunk to file");
        Ok(())
    }

    async fn get(&self, hash: ChunkHash) -> Result<Option<Bytes>, StoreError> {
        let path = self.blob_path(&hash);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let actual = ChunkHash::from_data(&data);
                if actual != hash {
                    error!(expected = %hash, %actual, "chunk corruption detected on read");
                    return Err(StoreError::Corrupt {
                        expected: hash,
                        actual,
                    });
                }
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete(&self, hash: ChunkHash) -> Result<(), StoreError> {
        let path = self.blob_path(&hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%hash, "deleted chunk file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn contains(&self, hash: ChunkHash) -> Result<bool, StoreError> {
        match tokio::fs::metadata(self.blob_path(&hash)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<ChunkHash>, StoreError> {
        Ok(self.walk().await?.into_iter().map(|(hash, _)| hash).collect())
    }

    async fn verify(&self, hash: ChunkHash) -> Result<bool, StoreError> {
        match tokio::fs::read(self.blob_path(&hash)).await {
            Ok(data) => Ok(ChunkHash::from_data(&data) == hash),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ChunkNotFound(hash))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn usage(&self) -> Result<BlobUsage, StoreError> {
        let mut usage = BlobUsage::default();
        for (_, path) in self.walk().await? {
            usage.chunks += 1;
            usage.bytes += tokio::fs::metadata(&path).await?.len();
        }
        Ok(usage)
    }
}
