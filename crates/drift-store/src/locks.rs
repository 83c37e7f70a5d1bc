//! Striped per-key locks and chunk leases.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use drift_types::ChunkHash;
use tokio::sync::{Mutex, MutexGuard, RwLock};

const STRIPES: usize = 64;

/// Striped async mutexes keyed by chunk hash.
///
/// Writers of the same hash serialize; unrelated hashes usually land on
/// different stripes and proceed concurrently.
pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(hash: &ChunkHash) -> usize {
        hash.as_bytes()[0] as usize % STRIPES
    }

    pub(crate) async fn lock(&self, hash: &ChunkHash) -> MutexGuard<'_, ()> {
        self.stripes[Self::stripe(hash)].lock().await
    }

    /// Lock every stripe covering `hashes`, in ascending stripe order.
    pub(crate) async fn lock_many<'a>(
        &self,
        hashes: impl IntoIterator<Item = &'a ChunkHash>,
    ) -> Vec<MutexGuard<'_, ()>> {
        let stripes: BTreeSet<usize> = hashes.into_iter().map(Self::stripe).collect();
        let mut guards = Vec::with_capacity(stripes.len());
        for i in stripes {
            guards.push(self.stripes[i].lock().await);
        }
        guards
    }
}

/// State shared between a store and the leases it hands out.
#[derive(Default)]
pub(crate) struct PinTable {
    /// Held shared by writers and lease acquisition, exclusively by gc.
    pub(crate) gate: RwLock<()>,
    counts: StdMutex<HashMap<ChunkHash, usize>>,
}

impl PinTable {
    pub(crate) fn is_pinned(&self, hash: &ChunkHash) -> bool {
        self.counts
            .lock()
            .expect("lock poisoned")
            .contains_key(hash)
    }

    pub(crate) fn pinned(&self) -> usize {
        self.counts.lock().expect("lock poisoned").len()
    }

    fn pin(&self, hash: ChunkHash) {
        *self
            .counts
            .lock()
            .expect("lock poisoned")
            .entry(hash)
            .or_insert(0) += 1;
    }

    fn unpin(&self, hash: &ChunkHash) {
        let mut counts = self.counts.lock().expect("lock poisoned");
        if let Some(n) = counts.get_mut(hash) {
            *n -= 1;
            if *n == 0 {
                counts.remove(hash);
            }
        }
    }
}

/// Pins a set of chunk hashes against garbage collection until dropped.
///
/// Taken before any chunk of a not-yet-committed stream is written or
/// fetched, so a concurrent `gc` cannot reclaim it mid-transfer.
pub struct ChunkLease {
    table: Arc<PinTable>,
    hashes: Vec<ChunkHash>,
}

impl ChunkLease {
    pub(crate) async fn acquire(
        table: Arc<PinTable>,
        hashes: impl IntoIterator<Item = ChunkHash>,
    ) -> Self {
        let mut lease = Self {
            table,
            hashes: Vec::new(),
        };
        lease.extend(hashes).await;
        lease
    }

    /// Pin additional hashes under this lease.
    ///
    /// Waits for any running gc to finish first.
    pub async fn extend(&mut self, hashes: impl IntoIterator<Item = ChunkHash>) {
        let _gate = self.table.gate.read().await;
        for hash in hashes {
            self.table.pin(hash);
            self.hashes.push(hash);
        }
    }

    /// Whether this lease pins `hash`.
    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.hashes.contains(hash)
    }

    /// Number of pins held, counting repeats.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Whether the lease pins nothing.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl Drop for ChunkLease {
    fn drop(&mut self) {
        for hash in &self.hashes {
            self.table.unpin(hash);
        }
    }
}

impl std::fmt::Debug for ChunkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkLease")
            .field("pins", &self.hashes.len())
            .finish()
    }
}
