//! Filesystem-backed repository.
//!
//! Layout under the root directory:
//! - `chunks/{hex[0..2]}/{hex[2..4]}/{hex}`: raw chunk bytes
//! - `streams/{hex}`: postcard-encoded manifests
//! - `trees/{hex}`: postcard-encoded tree manifests
//!
//! Suitable for a shared mount or a local mirror.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use drift_cas::{
    CasError, deserialize_stream, deserialize_tree, serialize_stream, serialize_tree,
};
use drift_store::{BlobStore, FileBlobStore, StoreError, write_atomic};
use drift_types::{ChunkHash, Stream, StreamId, Tree, TreeId};
use tracing::debug;

use crate::error::RepoError;
use crate::traits::Repository;

/// Repository stored in a directory tree.
pub struct FileRepository {
    chunks: FileBlobStore,
    streams_dir: PathBuf,
    trees_dir: PathBuf,
}

impl FileRepository {
    /// Open (creating if needed) a repository rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, RepoError> {
        let root = root.as_ref();
        let chunks = FileBlobStore::new(root.join("chunks")).map_err(store_err)?;
        let streams_dir = root.join("streams");
        std::fs::create_dir_all(&streams_dir)?;
        let trees_dir = root.join("trees");
        std::fs::create_dir_all(&trees_dir)?;
        Ok(Self {
            chunks,
            streams_dir,
            trees_dir,
        })
    }

    fn stream_path(&self, id: &StreamId) -> PathBuf {
        self.streams_dir.join(id.to_string())
    }

    fn tree_path(&self, id: &TreeId) -> PathBuf {
        self.trees_dir.join(id.to_string())
    }
}

fn store_err(e: StoreError) -> RepoError {
    match e {
        StoreError::Io(e) => RepoError::Io(e),
        StoreError::Corrupt { expected, .. } | StoreError::HashMismatch { expected, .. } => {
            RepoError::HashMismatch(expected)
        }
        StoreError::ChunkNotFound(hash) => RepoError::ChunkNotFound(hash),
        other => RepoError::Rejected(other.to_string()),
    }
}

#[async_trait::async_trait]
impl Repository for FileRepository {
    async fn has_chunk(&self, hash: ChunkHash) -> Result<bool, RepoError> {
        self.chunks.contains(hash).await.map_err(store_err)
    }

    async fn fetch_chunk(&self, hash: ChunkHash) -> Result<Bytes, RepoError> {
        self.chunks
            .get(hash)
            .await
            .map_err(store_err)?
            .ok_or(RepoError::ChunkNotFound(hash))
    }

    async fn put_chunk(&self, hash: ChunkHash, data: Bytes) -> Result<(), RepoError> {
        if ChunkHash::from_data(&data) != hash {
            return Err(RepoError::HashMismatch(hash));
        }
        if self.chunks.contains(hash).await.map_err(store_err)? {
            return Ok(());
        }
        self.chunks.put(hash, data).await.map_err(store_err)
    }

    async fn fetch_stream(&self, id: StreamId) -> Result<Stream, RepoError> {
        let bytes = match tokio::fs::read(self.stream_path(&id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoError::StreamNotFound(id));
            }
            Err(e) => return Err(RepoError::Io(e)),
        };
        let stream = deserialize_stream(&bytes)?;
        if stream.id != id {
            return Err(CasError::StreamIdMismatch {
                claimed: id,
                actual: stream.id,
            }
            .into());
        }
        Ok(stream)
    }

    async fn put_stream(&self, stream: &Stream) -> Result<(), RepoError> {
        let bytes = serialize_stream(stream)?;
        // Validate the way a receiving server would.
        deserialize_stream(&bytes)?;

        match self.fetch_stream(stream.id).await {
            Ok(existing) if existing == *stream => return Ok(()),
            Ok(_) => return Err(RepoError::ImmutableConflict(stream.id)),
            Err(RepoError::StreamNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let path = self.stream_path(&stream.id);
        write_atomic(path.clone(), Bytes::from(bytes)).await?;
        debug!(stream_id = %stream.id, path = %path.display(), "repository stored stream");
        Ok(())
    }

    async fn has_stream(&self, id: StreamId) -> Result<bool, RepoError> {
        Ok(tokio::fs::try_exists(self.stream_path(&id)).await?)
    }

    async fn fetch_tree(&self, id: TreeId) -> Result<Tree, RepoError> {
        let bytes = match tokio::fs::read(self.tree_path(&id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoError::TreeNotFound(id));
            }
            Err(e) => return Err(RepoError::Io(e)),
        };
        let tree = deserialize_tree(&bytes)?;
        if tree.id != id {
            return Err(CasError::TreeIdMismatch {
                claimed: id,
                actual: tree.id,
            }
            .into());
        }
        Ok(tree)
    }

    async fn put_tree(&self, tree: &Tree) -> Result<(), RepoError> {
        let bytes = serialize_tree(tree)?;
        deserialize_tree(&bytes)?;
        for (path, id) in tree.streams() {
            if !self.has_stream(id).await? {
                return Err(RepoError::Rejected(format!(
                    "tree {} references missing stream {id} at {path}",
                    tree.id
                )));
            }
        }

        let path = self.tree_path(&tree.id);
        write_atomic(path.clone(), Bytes::from(bytes)).await?;
        debug!(tree_id = %tree.id, path = %path.display(), "repository stored tree");
        Ok(())
    }
}
