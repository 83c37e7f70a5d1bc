//! Core trait and types for chunk blob storage.

use bytes::Bytes;
use drift_types::ChunkHash;

use crate::error::StoreError;

/// Number of blobs and bytes held by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobUsage {
    /// Stored blobs.
    pub chunks: u64,
    /// Sum of blob lengths in bytes.
    pub bytes: u64,
}

/// Trait for storing and retrieving raw chunk bytes by hash.
///
/// Backends know nothing about streams or references; the
/// [`ContentStore`](crate::ContentStore) layers those on top.
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob under the given hash, replacing any previous blob.
    async fn put(&self, hash: ChunkHash, data: Bytes) -> Result<(), StoreError>;

    /// Retrieve a blob by hash. Returns `None` if not found.
    async fn get(&self, hash: ChunkHash) -> Result<Option<Bytes>, StoreError>;

    /// Delete a blob. Deleting a missing blob is not an error.
    async fn delete(&self, hash: ChunkHash) -> Result<(), StoreError>;

    /// Check whether a blob exists.
    async fn contains(&self, hash: ChunkHash) -> Result<bool, StoreError>;

    /// List all stored hashes.
    async fn list(&self) -> Result<Vec<ChunkHash>, StoreError>;

    /// Re-hash a stored blob and compare it to its key.
    async fn verify(&self, hash: ChunkHash) -> Result<bool, StoreError>;

    /// Report how many blobs and bytes are stored.
    async fn usage(&self) -> Result<BlobUsage, StoreError>;
}
