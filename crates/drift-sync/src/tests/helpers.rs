//! Shared test utilities for drift-sync tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use drift_cas::Chunker;
use drift_repo::{InstrumentedRepository, MemoryRepository, RepoError, Repository};
use drift_store::ContentStore;
use drift_types::{ChunkHash, Stream, StreamId, SyncConfig, Tree, TreeId};

use crate::SyncEngine;

/// Chunk size used by most tests; small so files stay tiny.
pub const SMALL_CHUNK: u32 = 1024;

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// Retry quickly so failure tests don't sleep.
pub fn fast_config(concurrency: usize, max_retries: u32) -> SyncConfig {
    SyncConfig {
        concurrency,
        max_retries,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
    }
}

/// An engine over an in-memory store and an instrumented in-memory repository.
pub struct Harness {
    pub engine: SyncEngine,
    pub store: Arc<ContentStore>,
    pub repo: Arc<InstrumentedRepository>,
    pub remote: Arc<MemoryRepository>,
}

pub fn harness(config: SyncConfig) -> Harness {
    harness_with(config, SMALL_CHUNK)
}

pub fn harness_with(config: SyncConfig, chunk_size: u32) -> Harness {
    let remote = Arc::new(MemoryRepository::new());
    let repo = Arc::new(InstrumentedRepository::new(remote.clone()));
    let store = Arc::new(ContentStore::in_memory());
    let engine = SyncEngine::new(store.clone(), repo.clone(), config)
        .with_chunker(Chunker::new(chunk_size));
    Harness {
        engine,
        store,
        repo,
        remote,
    }
}

/// A second engine sharing `remote` but with its own empty store.
pub fn peer(remote: Arc<dyn Repository>, config: SyncConfig) -> (SyncEngine, Arc<ContentStore>) {
    let store = Arc::new(ContentStore::in_memory());
    let engine = SyncEngine::new(store.clone(), remote, config)
        .with_chunker(Chunker::new(SMALL_CHUNK));
    (engine, store)
}

/// Write `data` to `dir/name`, creating parent directories.
pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    path
}

/// Serves one chunk with substituted bytes; everything else passes through.
pub struct CorruptingRepository {
    pub inner: Arc<dyn Repository>,
    pub target: ChunkHash,
    pub replacement: Bytes,
}

#[async_trait::async_trait]
impl Repository for CorruptingRepository {
    async fn has_chunk(&self, hash: ChunkHash) -> Result<bool, RepoError> {
        self.inner.has_chunk(hash).await
    }

    async fn fetch_chunk(&self, hash: ChunkHash) -> Result<Bytes, RepoError> {
        if hash == self.target {
            return Ok(self.replacement.clone());
        }
        self.inner.fetch_chunk(hash).await
    }

    async fn put_chunk(&self, hash: ChunkHash, data: Bytes) -> Result<(), RepoError> {
        self.inner.put_chunk(hash, data).await
    }

    async fn fetch_stream(&self, id: StreamId) -> Result<Stream, RepoError> {
        self.inner.fetch_stream(id).await
    }

    async fn put_stream(&self, stream: &Stream) -> Result<(), RepoError> {
        self.inner.put_stream(stream).await
    }

    async fn fetch_tree(&self, id: TreeId) -> Result<Tree, RepoError> {
        self.inner.fetch_tree(id).await
    }

    async fn put_tree(&self, tree: &Tree) -> Result<(), RepoError> {
        self.inner.put_tree(tree).await
    }
}
