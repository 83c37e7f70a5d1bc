//! Local content store for drift.
//!
//! Chunk bytes are kept by a [`BlobStore`] backend ([`MemoryBlobStore`],
//! [`FileBlobStore`], or the latency-injecting [`SlowBlobStore`]); manifests
//! and the chunk → stream reverse index are kept by a [`StoreIndex`]. The
//! [`ContentStore`] ties them together with per-key locking, leases and gc.

mod atomic;
mod error;
mod file_store;
mod index;
mod locks;
mod memory_store;
mod slow_store;
mod store;
mod traits;

pub use atomic::write_atomic;
pub use error::StoreError;
pub use file_store::FileBlobStore;
pub use index::StoreIndex;
pub use locks::ChunkLease;
pub use memory_store::MemoryBlobStore;
pub use slow_store::SlowBlobStore;
pub use store::{ContentStore, PutOutcome, StoreStats};
pub use traits::{BlobStore, BlobUsage};
