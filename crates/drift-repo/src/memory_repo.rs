//! In-memory reference repository.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use drift_cas::{verify_stream, verify_tree};
use drift_types::{ChunkHash, Stream, StreamId, Tree, TreeId};
use tracing::debug;

use crate::error::RepoError;
use crate::traits::Repository;

/// Repository held in process memory.
///
/// Behaves like a well-formed server: re-verifies chunk digests and
/// manifests on receipt, treats identical re-puts as no-ops, and refuses
/// manifests whose chunks (or trees whose streams) it does not hold.
#[derive(Default)]
pub struct MemoryRepository {
    chunks: RwLock<HashMap<ChunkHash, Bytes>>,
    streams: RwLock<HashMap<StreamId, Stream>>,
    trees: RwLock<HashMap<TreeId, Tree>>,
}

impl MemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().expect("lock poisoned").len()
    }

    /// Number of manifests held.
    pub fn stream_count(&self) -> usize {
        self.streams.read().expect("lock poisoned").len()
    }

    /// Number of trees held.
    pub fn tree_count(&self) -> usize {
        self.trees.read().expect("lock poisoned").len()
    }

    /// Drop a chunk, as a remote-side gc would.
    pub fn evict_chunk(&self, hash: &ChunkHash) -> bool {
        self.chunks
            .write()
            .expect("lock poisoned")
            .remove(hash)
            .is_some()
    }
}

#[async_trait::async_trait]
impl Repository for MemoryRepository {
    async fn has_chunk(&self, hash: ChunkHash) -> Result<bool, RepoError> {
        Ok(self.chunks.read().expect("lock poisoned").contains_key(&hash))
    }

    async fn fetch_chunk(&self, hash: ChunkHash) -> Result<Bytes, RepoError> {
        self.chunks
            .read()
            .expect("lock poisoned")
            .get(&hash)
            .cloned()
            .ok_or(RepoError::ChunkNotFound(hash))
    }

    async fn put_chunk(&self, hash: ChunkHash, data: Bytes) -> Result<(), RepoError> {
        if ChunkHash::from_data(&data) != hash {
            return Err(RepoError::HashMismatch(hash));
        }
        debug!(%hash, size = data.len(), "repository stored chunk");
        self.chunks
            .write()
            .expect("lock poisoned")
            .entry(hash)
            .or_insert(data);
        Ok(())
    }

    async fn fetch_stream(&self, id: StreamId) -> Result<Stream, RepoError> {
        self.streams
            .read()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(RepoError::StreamNotFound(id))
    }

    async fn put_stream(&self, stream: &Stream) -> Result<(), RepoError> {
        verify_stream(stream)?;
        {
            let chunks = self.chunks.read().expect("lock poisoned");
            if let Some(missing) = stream.chunks.iter().find(|h| !chunks.contains_key(*h)) {
                return Err(RepoError::Rejected(format!(
                    "stream {} references missing chunk {missing}",
                    stream.id
                )));
            }
        }

        let mut streams = self.streams.write().expect("lock poisoned");
        match streams.get(&stream.id) {
            Some(existing) if existing == stream => Ok(()),
            Some(_) => Err(RepoError::ImmutableConflict(stream.id)),
            None => {
                streams.insert(stream.id, stream.clone());
                debug!(stream_id = %stream.id, "repository stored stream");
                Ok(())
            }
        }
    }

    async fn has_stream(&self, id: StreamId) -> Result<bool, RepoError> {
        Ok(self.streams.read().expect("lock poisoned").contains_key(&id))
    }

    async fn fetch_tree(&self, id: TreeId) -> Result<Tree, RepoError> {
        self.trees
            .read()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(RepoError::TreeNotFound(id))
    }

    async fn put_tree(&self, tree: &Tree) -> Result<(), RepoError> {
        verify_tree(tree)?;
        {
            let streams = self.streams.read().expect("lock poisoned");
            if let Some((path, missing)) = tree.streams().find(|(_, id)| !streams.contains_key(id)) {
                return Err(RepoError::Rejected(format!(
                    "tree {} references missing stream {missing} at {path}",
                    tree.id
                )));
            }
        }
        self.trees
            .write()
            .expect("lock poisoned")
            .entry(tree.id)
            .or_insert_with(|| tree.clone());
        debug!(tree_id = %tree.id, entries = tree.entries.len(), "repository stored tree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use drift_cas::build_stream;
    use drift_types::FileMeta;

    use super::*;

    fn one_chunk_stream(data: &[u8]) -> Stream {
        build_stream(
            64,
            vec![ChunkHash::from_data(data)],
            FileMeta {
                size: data.len() as u64,
                ..FileMeta::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_chunk_put_fetch() {
        let repo = MemoryRepository::new();
        let data = Bytes::from_static(b"remote chunk");
        let hash = ChunkHash::from_data(&data);

        assert!(!repo.has_chunk(hash).await.unwrap());
        repo.put_chunk(hash, data.clone()).await.unwrap();
        repo.put_chunk(hash, data.clone()).await.unwrap();
        assert!(repo.has_chunk(hash).await.unwrap());
        assert_eq!(repo.fetch_chunk(hash).await.unwrap(), data);
        assert_eq!(repo.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_put_chunk_reverifies() {
        let repo = MemoryRepository::new();
        let hash = ChunkHash::from_data(b"claimed");
        let err = repo
            .put_chunk(hash, Bytes::from_static(b"actual"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::HashMismatch(h) if h == hash));
        assert_eq!(repo.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let repo = MemoryRepository::new();
        let hash = ChunkHash::from_data(b"missing");
        assert!(matches!(
            repo.fetch_chunk(hash).await,
            Err(RepoError::ChunkNotFound(_))
        ));
        let id = StreamId::from_data(b"missing");
        assert!(matches!(
            repo.fetch_stream(id).await,
            Err(RepoError::StreamNotFound(_))
        ));
        assert!(!repo.has_stream(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_stream_requires_chunks() {
        let repo = MemoryRepository::new();
        let stream = one_chunk_stream(b"body");
        let err = repo.put_stream(&stream).await.unwrap_err();
        assert!(matches!(err, RepoError::Rejected(_)));

        repo.put_chunk(stream.chunks[0], Bytes::from_static(b"body"))
            .await
            .unwrap();
        repo.put_stream(&stream).await.unwrap();
        repo.put_stream(&stream).await.unwrap();
        assert_eq!(repo.fetch_stream(stream.id).await.unwrap(), stream);
        assert_eq!(repo.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_put_tree_requires_streams() {
        let repo = MemoryRepository::new();
        let stream = one_chunk_stream(b"body");
        let tree = drift_cas::build_tree(
            0o755,
            vec![drift_types::TreeEntry {
                path: "body.txt".into(),
                mode: 0o644,
                kind: drift_types::EntryKind::File(stream.id),
            }],
        )
        .unwrap();

        assert!(matches!(
            repo.put_tree(&tree).await,
            Err(RepoError::Rejected(_))
        ));
        assert!(matches!(
            repo.fetch_tree(tree.id).await,
            Err(RepoError::TreeNotFound(_))
        ));

        repo.put_chunk(stream.chunks[0], Bytes::from_static(b"body"))
            .await
            .unwrap();
        repo.put_stream(&stream).await.unwrap();
        repo.put_tree(&tree).await.unwrap();
        repo.put_tree(&tree).await.unwrap();
        assert_eq!(repo.fetch_tree(tree.id).await.unwrap(), tree);
        assert_eq!(repo.tree_count(), 1);
    }

    #[tokio::test]
    async fn test_put_stream_rejects_tampered_manifest() {
        let repo = MemoryRepository::new();
        let mut stream = one_chunk_stream(b"body");
        repo.put_chunk(stream.chunks[0], Bytes::from_static(b"body"))
            .await
            .unwrap();
        stream.meta.mtime = 42;
        assert!(matches!(
            repo.put_stream(&stream).await,
            Err(RepoError::Cas(_))
        ));
    }
}
