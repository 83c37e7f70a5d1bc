//! Shared harness for drift end-to-end tests.
//!
//! A [`Site`] is one machine's view: an on-disk [`ContentStore`] in its own
//! temporary directory and a [`SyncEngine`] pointed at a shared repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use drift_cas::Chunker;
use drift_repo::Repository;
use drift_store::ContentStore;
use drift_sync::SyncEngine;
use drift_types::SyncConfig;
use tempfile::TempDir;

/// Small chunks keep test files small while still spanning many chunks.
pub const CHUNK: u32 = 4096;

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

/// Retry quickly so failure paths don't sleep.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        concurrency: 4,
        max_retries: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
    }
}

/// One participant with a persistent local store.
pub struct Site {
    pub dir: TempDir,
    pub store: Arc<ContentStore>,
    pub engine: SyncEngine,
    repo: Arc<dyn Repository>,
}

impl Site {
    /// Create a site with a fresh store directory.
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = Self::open(dir.path(), repo.clone());
        Self {
            dir,
            store,
            engine,
            repo,
        }
    }

    /// Drop the store and open it again from disk, as after a restart.
    pub fn restart(self) -> Self {
        let Self {
            dir,
            store,
            engine,
            repo,
        } = self;
        drop(engine);
        drop(store);
        let (store, engine) = Self::open(dir.path(), repo.clone());
        Self {
            dir,
            store,
            engine,
            repo,
        }
    }

    /// Directory for source and destination files, outside the store.
    pub fn files(&self) -> PathBuf {
        let path = self.dir.path().join("files");
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn open(dir: &Path, repo: Arc<dyn Repository>) -> (Arc<ContentStore>, SyncEngine) {
        let store = Arc::new(ContentStore::open(dir.join("store")).unwrap());
        let engine = SyncEngine::new(store.clone(), repo, fast_config())
            .with_chunker(Chunker::new(CHUNK));
        (store, engine)
    }
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
