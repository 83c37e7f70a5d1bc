//! The capability set every repository transport implements.

use bytes::Bytes;
use drift_types::{ChunkHash, Stream, StreamId, Tree, TreeId};

use crate::error::RepoError;

/// A remote content-addressed store of chunks, stream manifests and tree
/// manifests.
///
/// Operations on different keys carry no ordering guarantee, and every
/// implementation must be safe to call concurrently from many workers.
/// Puts are idempotent so callers can retry them freely.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// Whether the repository holds a chunk.
    async fn has_chunk(&self, hash: ChunkHash) -> Result<bool, RepoError>;

    /// Fetch a chunk's bytes.
    async fn fetch_chunk(&self, hash: ChunkHash) -> Result<Bytes, RepoError>;

    /// Upload a chunk. The repository re-verifies the digest.
    async fn put_chunk(&self, hash: ChunkHash, data: Bytes) -> Result<(), RepoError>;

    /// Fetch and validate a manifest.
    async fn fetch_stream(&self, id: StreamId) -> Result<Stream, RepoError>;

    /// Publish a manifest. Callers must have uploaded every chunk first.
    async fn put_stream(&self, stream: &Stream) -> Result<(), RepoError>;

    /// Fetch and validate a tree manifest.
    async fn fetch_tree(&self, id: TreeId) -> Result<Tree, RepoError>;

    /// Publish a tree. Callers must have published every stream it lists first.
    async fn put_tree(&self, tree: &Tree) -> Result<(), RepoError>;

    /// Whether the repository holds a manifest.
    async fn has_stream(&self, id: StreamId) -> Result<bool, RepoError> {
        match self.fetch_stream(id).await {
            Ok(_) => Ok(true),
            Err(RepoError::StreamNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
