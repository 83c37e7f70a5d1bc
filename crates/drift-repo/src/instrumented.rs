//! A [`Repository`] wrapper that records calls and injects faults.
//!
//! Wraps any repository and keeps:
//! - per-operation call counters (every attempt, including failed ones)
//! - a sequenced journal of operations that completed successfully, in
//!   completion order, so traces like "every chunk before its manifest"
//!   can be checked after a run
//! - the peak number of concurrent chunk transfers
//!
//! Faults: a number of transient failures per operation kind, transient
//! failures pinned to a specific chunk, optional latency, and a hard
//! interruption after a given number of successful chunk uploads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use drift_types::{ChunkHash, Stream, StreamId, Tree, TreeId};
use tracing::debug;

use crate::error::RepoError;
use crate::traits::Repository;

/// Repository operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoOp {
    HasChunk,
    FetchChunk,
    PutChunk,
    FetchStream,
    PutStream,
    HasStream,
    FetchTree,
    PutTree,
}

/// One successfully completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoEvent {
    /// `has_chunk` answered.
    HasChunk { hash: ChunkHash, present: bool },
    /// `fetch_chunk` returned bytes.
    FetchChunk(ChunkHash),
    /// `put_chunk` was accepted.
    PutChunk(ChunkHash),
    /// `fetch_stream` returned a manifest.
    FetchStream(StreamId),
    /// `put_stream` was accepted.
    PutStream(StreamId),
    /// `fetch_tree` returned a tree.
    FetchTree(TreeId),
    /// `put_tree` was accepted.
    PutTree(TreeId),
}

#[derive(Default)]
struct Faults {
    transient: HashMap<RepoOp, u32>,
    chunk_transient: HashMap<ChunkHash, u32>,
    interrupt_after_puts: Option<u64>,
}

/// Counting, journaling, fault-injecting repository wrapper.
pub struct InstrumentedRepository {
    inner: Arc<dyn Repository>,
    counts: Mutex<HashMap<RepoOp, u64>>,
    journal: Mutex<Vec<RepoEvent>>,
    faults: Mutex<Faults>,
    puts_ok: AtomicU64,
    interrupted: AtomicBool,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InstrumentedRepository {
    /// Wrap a repository with no faults configured.
    pub fn new(inner: Arc<dyn Repository>) -> Self {
        Self {
            inner,
            counts: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            puts_ok: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` calls of `op` with a transient error.
    pub fn fail_transient(&self, op: RepoOp, times: u32) {
        *self
            .faults
            .lock()
            .expect("lock poisoned")
            .transient
            .entry(op)
            .or_insert(0) += times;
    }

    /// Fail the next `times` transfers (`put_chunk` or `fetch_chunk`) of one chunk.
    pub fn fail_chunk(&self, hash: ChunkHash, times: u32) {
        *self
            .faults
            .lock()
            .expect("lock poisoned")
            .chunk_transient
            .entry(hash)
            .or_insert(0) += times;
    }

    /// After `n` more successful `put_chunk` calls, refuse every operation
    /// with a non-retryable error until [`resume`](Self::resume).
    pub fn interrupt_after_puts(&self, n: u64) {
        let target = self.puts_ok.load(Ordering::SeqCst) + n;
        self.faults.lock().expect("lock poisoned").interrupt_after_puts = Some(target);
        if n == 0 {
            self.interrupted.store(true, Ordering::SeqCst);
        }
    }

    /// Clear an interruption and any pending interruption point.
    pub fn resume(&self) {
        self.faults.lock().expect("lock poisoned").interrupt_after_puts = None;
        self.interrupted.store(false, Ordering::SeqCst);
    }

    /// Delay every chunk transfer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("lock poisoned") = latency;
    }

    /// Calls made for `op`, including failed attempts.
    pub fn count(&self, op: RepoOp) -> u64 {
        self.counts
            .lock()
            .expect("lock poisoned")
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Successful operations in completion order.
    pub fn journal(&self) -> Vec<RepoEvent> {
        self.journal.lock().expect("lock poisoned").clone()
    }

    /// Highest number of chunk transfers observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Reset counters, journal and concurrency tracking. Faults are kept.
    pub fn reset(&self) {
        self.counts.lock().expect("lock poisoned").clear();
        self.journal.lock().expect("lock poisoned").clear();
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    /// Count the call and decide whether it should fail.
    fn enter(&self, op: RepoOp, chunk: Option<ChunkHash>) -> Result<(), RepoError> {
        *self
            .counts
            .lock()
            .expect("lock poisoned")
            .entry(op)
            .or_insert(0) += 1;

        if self.interrupted.load(Ordering::SeqCst) {
            return Err(RepoError::Rejected("connection interrupted".into()));
        }

        let mut faults = self.faults.lock().expect("lock poisoned");
        if let Some(remaining) = faults.transient.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            debug!(?op, "injecting transient failure");
            return Err(RepoError::Transient(format!("injected {op:?} failure")));
        }
        if let Some(hash) = chunk
            && let Some(remaining) = faults.chunk_transient.get_mut(&hash)
            && *remaining > 0
        {
            *remaining -= 1;
            debug!(%hash, ?op, "injecting transient chunk failure");
            return Err(RepoError::Transient(format!("injected failure for chunk {hash}")));
        }
        Ok(())
    }

    fn record(&self, event: RepoEvent) {
        self.journal.lock().expect("lock poisoned").push(event);
    }

    async fn transfer<T, F>(&self, fut: F) -> Result<T, RepoError>
    where
        F: std::future::Future<Output = Result<T, RepoError>>,
    {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock().expect("lock poisoned");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = fut.await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait::async_trait]
impl Repository for InstrumentedRepository {
    async fn has_chunk(&self, hash: ChunkHash) -> Result<bool, RepoError> {
        self.enter(RepoOp::HasChunk, None)?;
        let present = self.inner.has_chunk(hash).await?;
        self.record(RepoEvent::HasChunk { hash, present });
        Ok(present)
    }

    async fn fetch_chunk(&self, hash: ChunkHash) -> Result<Bytes, RepoError> {
        self.enter(RepoOp::FetchChunk, Some(hash))?;
        let data = self.transfer(self.inner.fetch_chunk(hash)).await?;
        self.record(RepoEvent::FetchChunk(hash));
        Ok(data)
    }

    async fn put_chunk(&self, hash: ChunkHash, data: Bytes) -> Result<(), RepoError> {
        self.enter(RepoOp::PutChunk, Some(hash))?;
        self.transfer(self.inner.put_chunk(hash, data)).await?;
        self.record(RepoEvent::PutChunk(hash));

        let done = self.puts_ok.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.faults.lock().expect("lock poisoned").interrupt_after_puts;
        if limit.is_some_and(|limit| done >= limit) {
            debug!(done, "interrupting repository after chunk uploads");
            self.interrupted.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn fetch_stream(&self, id: StreamId) -> Result<Stream, RepoError> {
        self.enter(RepoOp::FetchStream, None)?;
        let stream = self.inner.fetch_stream(id).await?;
        self.record(RepoEvent::FetchStream(id));
        Ok(stream)
    }

    async fn put_stream(&self, stream: &Stream) -> Result<(), RepoError> {
        self.enter(RepoOp::PutStream, None)?;
        self.inner.put_stream(stream).await?;
        self.record(RepoEvent::PutStream(stream.id));
        Ok(())
    }

    async fn has_stream(&self, id: StreamId) -> Result<bool, RepoError> {
        self.enter(RepoOp::HasStream, None)?;
        self.inner.has_stream(id).await
    }

    async fn fetch_tree(&self, id: TreeId) -> Result<Tree, RepoError> {
        self.enter(RepoOp::FetchTree, None)?;
        let tree = self.inner.fetch_tree(id).await?;
        self.record(RepoEvent::FetchTree(id));
        Ok(tree)
    }

    async fn put_tree(&self, tree: &Tree) -> Result<(), RepoError> {
        self.enter(RepoOp::PutTree, None)?;
        self.inner.put_tree(tree).await?;
        self.record(RepoEvent::PutTree(tree.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRepository;

    fn wrapped() -> InstrumentedRepository {
        InstrumentedRepository::new(Arc::new(MemoryRepository::new()))
    }

    #[tokio::test]
    async fn test_counts_and_journal() {
        let repo = wrapped();
        let data = Bytes::from_static(b"journaled");
        let hash = ChunkHash::from_data(&data);

        assert!(!repo.has_chunk(hash).await.unwrap());
        repo.put_chunk(hash, data).await.unwrap();
        repo.fetch_chunk(hash).await.unwrap();

        assert_eq!(repo.count(RepoOp::HasChunk), 1);
        assert_eq!(repo.count(RepoOp::PutChunk), 1);
        assert_eq!(repo.count(RepoOp::PutStream), 0);
        assert_eq!(
            repo.journal(),
            vec![
                RepoEvent::HasChunk {
                    hash,
                    present: false
                },
                RepoEvent::PutChunk(hash),
                RepoEvent::FetchChunk(hash),
            ]
        );

        repo.reset();
        assert_eq!(repo.count(RepoOp::HasChunk), 0);
        assert!(repo.journal().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_counted_not_journaled() {
        let repo = wrapped();
        let data = Bytes::from_static(b"flaky");
        let hash = ChunkHash::from_data(&data);
        repo.fail_transient(RepoOp::PutChunk, 2);

        for _ in 0..2 {
            let err = repo.put_chunk(hash, data.clone()).await.unwrap_err();
            assert!(err.is_transient());
        }
        repo.put_chunk(hash, data).await.unwrap();

        assert_eq!(repo.count(RepoOp::PutChunk), 3);
        assert_eq!(repo.journal(), vec![RepoEvent::PutChunk(hash)]);
    }

    #[tokio::test]
    async fn test_chunk_specific_failure() {
        let repo = wrapped();
        let flaky = Bytes::from_static(b"flaky");
        let fine = Bytes::from_static(b"fine");
        repo.fail_chunk(ChunkHash::from_data(&flaky), 1);

        repo.put_chunk(ChunkHash::from_data(&fine), fine).await.unwrap();
        assert!(
            repo.put_chunk(ChunkHash::from_data(&flaky), flaky.clone())
                .await
                .unwrap_err()
                .is_transient()
        );
        repo.put_chunk(ChunkHash::from_data(&flaky), flaky).await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_after_puts() {
        let repo = wrapped();
        repo.interrupt_after_puts(1);

        let a = Bytes::from_static(b"first");
        let b = Bytes::from_static(b"second");
        repo.put_chunk(ChunkHash::from_data(&a), a).await.unwrap();

        let err = repo
            .put_chunk(ChunkHash::from_data(&b), b.clone())
            .await
            .unwrap_err();
        assert!(!err.is_transient(), "interruption must not be retried");

        repo.resume();
        repo.put_chunk(ChunkHash::from_data(&b), b).await.unwrap();
    }

    #[tokio::test]
    async fn test_peak_in_flight_tracks_overlap() {
        let repo = Arc::new(wrapped());
        repo.set_latency(Duration::from_millis(20));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..4u8 {
            let repo = repo.clone();
            tasks.spawn(async move {
                let data = Bytes::from(vec![i; 8]);
                repo.put_chunk(ChunkHash::from_data(&data), data).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert!(repo.peak_in_flight() > 1);
        assert!(repo.peak_in_flight() <= 4);
    }
}
