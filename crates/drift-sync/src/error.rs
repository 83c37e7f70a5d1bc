//! Error types for the sync engine.

use std::path::PathBuf;

use drift_cas::CasError;
use drift_repo::RepoError;
use drift_store::StoreError;
use drift_types::ChunkHash;

use crate::phase::{FailureKind, SyncReport};

/// Errors that can occur while importing, pushing, pulling or inspecting.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Local content store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Non-retryable repository failure.
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    /// Chunking or manifest failure.
    #[error("cas error: {0}")]
    Cas(#[from] CasError),

    /// Chunk bytes did not hash to their key.
    #[error("hash mismatch: expected {expected}, data hashes to {actual}")]
    HashMismatch {
        /// The chunk hash the bytes were requested under.
        expected: ChunkHash,
        /// The hash of the bytes received.
        actual: ChunkHash,
    },

    /// A chunk had the right hash but the wrong length for its position.
    #[error("chunk {hash} has {actual} bytes, manifest expects {expected}")]
    LengthMismatch {
        /// The chunk.
        hash: ChunkHash,
        /// Length implied by the manifest.
        expected: u64,
        /// Length received.
        actual: u64,
    },

    /// A transient repository failure persisted past the retry budget.
    #[error("{what}: gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// The operation that kept failing.
        what: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// The last error seen.
        #[source]
        source: RepoError,
    },

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Reading a local file or directory failed.
    #[error("{}: {source}", .path.display())]
    Io {
        /// The path being read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The path is neither a regular file nor a directory.
    #[error("{}: not a regular file or directory", .0.display())]
    UnsupportedPath(PathBuf),

    /// A transfer worker panicked or was aborted unexpectedly.
    #[error("transfer worker failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// Classify this error for [`SyncPhase::Failed`](crate::SyncPhase::Failed).
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Store(StoreError::ChunkNotFound(_) | StoreError::StreamNotFound(_))
            | Self::Repo(
                RepoError::ChunkNotFound(_)
                | RepoError::StreamNotFound(_)
                | RepoError::TreeNotFound(_),
            ) => FailureKind::NotFound,
            Self::HashMismatch { .. }
            | Self::LengthMismatch { .. }
            | Self::Store(StoreError::HashMismatch { .. } | StoreError::Corrupt { .. })
            | Self::Repo(RepoError::HashMismatch(_))
            | Self::Repo(RepoError::Cas(
                CasError::StreamIdMismatch { .. } | CasError::TreeIdMismatch { .. },
            ))
            | Self::Cas(CasError::StreamIdMismatch { .. } | CasError::TreeIdMismatch { .. }) => {
                FailureKind::HashMismatch
            }
            Self::Store(StoreError::IncompleteStream { .. }) => FailureKind::IncompleteStream,
            Self::Store(StoreError::ImmutableConflict(_))
            | Self::Repo(RepoError::ImmutableConflict(_)) => FailureKind::ImmutableConflict,
            Self::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Repo(_) => FailureKind::Remote,
            Self::Store(_) | Self::Io { .. } | Self::UnsupportedPath(_) | Self::Worker(_) => {
                FailureKind::Local
            }
            Self::Cas(_) => FailureKind::Invalid,
        }
    }
}

/// A push or pull that ended in [`SyncPhase::Failed`](crate::SyncPhase::Failed).
///
/// Carries the report as it stood when the run stopped, so callers can see
/// how far it got and which stream or path it concerned.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SyncFailure {
    /// Report with `phase` set to `Failed`.
    pub report: Box<SyncReport>,
    /// What went wrong.
    pub error: SyncError,
}
