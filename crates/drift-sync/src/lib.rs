//! Push/pull synchronization between a local content store and a remote
//! repository.
//!
//! [`SyncEngine`] diffs a stream's chunks against the destination, moves
//! only the missing ones with bounded parallelism and retries, and commits
//! the manifest last. A run that stops early (failure, cancellation, a
//! crash) leaves no manifest behind, and re-running it skips every chunk
//! that already made it across.
//!
//! Directories travel as a [`Tree`](drift_types::Tree) manifest published
//! after all of its streams, and are restored with
//! [`SyncEngine::pull_tree`].

mod cancel;
mod engine;
mod error;
mod phase;
mod retry;
mod walk;

pub use cancel::CancelToken;
pub use engine::{SyncEngine, SyncResult};
pub use error::{SyncError, SyncFailure};
pub use phase::{Direction, FailureKind, StatusReport, SyncPhase, SyncReport, TreeReport};
pub use retry::RetryPolicy;

#[cfg(test)]
mod tests;
