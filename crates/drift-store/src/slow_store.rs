//! Blob backend that stalls each call for a seeded random interval, so
//! interleavings between commit, lease and gc show up in unit tests.

use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use drift_types::ChunkHash;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::StoreError;
use crate::traits::{BlobStore, BlobUsage};

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

/// Wraps another [`BlobStore`] and sleeps before forwarding.
///
/// Reads (`get`, `contains`, `verify`) and writes (`put`, `delete`) draw
/// from separate millisecond ranges. Listing is never delayed.
pub struct SlowBlobStore {
    inner: Arc<dyn BlobStore>,
    reads: RangeInclusive<u64>,
    writes: RangeInclusive<u64>,
    rng: Mutex<StdRng>,
}

impl SlowBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            reads: 0..=0,
            writes: 0..=0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Stall reads for `min_ms..=max_ms`.
    pub fn read_latency(self, min_ms: u64, max_ms: u64) -> Self {
        Self {
            reads: min_ms..=max_ms.max(min_ms),
            ..self
        }
    }

    /// Stall writes for `min_ms..=max_ms`.
    pub fn write_latency(self, min_ms: u64, max_ms: u64) -> Self {
        Self {
            writes: min_ms..=max_ms.max(min_ms),
            ..self
        }
    }

    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    fn pause_for(&self, access: Access) -> Duration {
        let range = match access {
            Access::Read => &self.reads,
            Access::Write => &self.writes,
        };
        let ms = if range.start() == range.end() {
            *range.start()
        } else {
            self.rng
                .lock()
                .expect("lock poisoned")
                .random_range(range.clone())
        };
        Duration::from_millis(ms)
    }

    async fn stall(&self, access: Access) {
        let pause = self.pause_for(access);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for SlowBlobStore {
    async fn put(&self, hash: ChunkHash, data: Bytes) -> Result<(), StoreError> {
        self.stall(Access::Write).await;
        self.inner.put(hash, data).await
    }

    async fn get(&self, hash: ChunkHash) -> Result<Option<Bytes>, StoreError> {
        self.stall(Access::Read).await;
        self.inner.get(hash).await
    }

    async fn delete(&self, hash: ChunkHash) -> Result<(), StoreError> {
        self.stall(Access::Write).await;
        self.inner.delete(hash).await
    }

    async fn contains(&self, hash: ChunkHash) -> Result<bool, StoreError> {
        self.stall(Access::Read).await;
        self.inner.contains(hash).await
    }

    async fn list(&self) -> Result<Vec<ChunkHash>, StoreError> {
        self.inner.list().await
    }

    async fn verify(&self, hash: ChunkHash) -> Result<bool, StoreError> {
        self.stall(Access::Read).await;
        self.inner.verify(hash).await
    }

    async fn usage(&self) -> Result<BlobUsage, StoreError> {
        self.inner.usage().await
    }
}
