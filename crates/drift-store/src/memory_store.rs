//! In-memory chunk blob backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use drift_types::ChunkHash;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{BlobStore, BlobUsage};

/// In-memory blob store backed by a `RwLock<HashMap>`.
///
/// Used for tests and for the `memory` storage backend.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ChunkHash, Bytes>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a blob without any checks, for corruption tests.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, hash: ChunkHash, data: &'static [u8]) {
        self.blobs
            .write()
            .expect("lock poisoned")
            .insert(hash, Bytes::from_static(data));
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, hash: ChunkHash, data: Bytes) -> Result<(), StoreError> {
        debug!(%hash, size = data.len(), "storing chunk in memory");
        self.blobs.write().expect("lock poisoned").insert(hash, data);
        Ok(())
    }

    async fn get(&self, hash: ChunkHash) -> Result<Option<Bytes>, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(map.get(&hash).cloned())
    }

    async fn delete(&self, hash: ChunkHash) -> Result<(), StoreError> {
        self.blobs.write().expect("lock poisoned").remove(&hash);
        debug!(%hash, "deleted chunk from memory");
        Ok(())
    }

    async fn contains(&self, hash: ChunkHash) -> Result<bool, StoreError> {
        Ok(self.blobs.read().expect("lock poisoned").contains_key(&hash))
    }

    async fn list(&self) -> Result<Vec<ChunkHash>, StoreError> {
        Ok(self
            .blobs
            .read()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect())
    }

    async fn verify(&self, hash: ChunkHash) -> Result<bool, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        match map.get(&hash) {
            Some(data) => Ok(ChunkHash::from_data(data) == hash),
            None => Err(StoreError::ChunkNotFound(hash)),
        }
    }

    async fn usage(&self) -> Result<BlobUsage, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(BlobUsage {
            chunks: map.len() as u64,
            bytes: map.values().map(|b| b.len() as u64).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"hello chunk");
        let hash = ChunkHash::from_data(&data);

        store.put(hash, data.clone()).await.unwrap();
        assert_eq!(store.get(hash).await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MemoryBlobStore::new();
        let hash = ChunkHash::from_data(b"absent");
        assert_eq!(store.get(hash).await.unwrap(), None);
        assert!(!store.contains(hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"short lived");
        let hash = ChunkHash::from_data(&data);

        store.put(hash, data).await.unwrap();
        store.delete(hash).await.unwrap();
        store.delete(hash).await.unwrap();
        assert!(!store.contains(hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_same_hash_twice_keeps_one_copy() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"same bytes");
        let hash = ChunkHash::from_data(&data);

        store.put(hash, data.clone()).await.unwrap();
        store.put(hash, data).await.unwrap();

        let usage = store.usage().await.unwrap();
        assert_eq!(usage.chunks, 1);
        assert_eq!(usage.bytes, 10);
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"pristine");
        let hash = ChunkHash::from_data(&data);

        store.put(hash, data).await.unwrap();
        assert!(store.verify(hash).await.unwrap());

        store.corrupt(hash, b"rotten");
        assert!(!store.verify(hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_missing_is_error() {
        let store = MemoryBlobStore::new();
        let result = store.verify(ChunkHash::from_data(b"nope")).await;
        assert!(matches!(result, Err(StoreError::ChunkNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_returns_all() {
        let store = MemoryBlobStore::new();
        let mut expected = Vec::new();
        for payload in [&b"one"[..], b"two", b"three"] {
            let hash = ChunkHash::from_data(payload);
            store.put(hash, Bytes::copy_from_slice(payload)).await.unwrap();
            expected.push(hash);
        }
        let mut listed = store.list().await.unwrap();
        listed.sort();
        expected.sort();
        assert_eq!(listed, expected);
    }
}
