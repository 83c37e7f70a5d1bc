//! Error types for repository clients.

use drift_cas::CasError;
use drift_types::{ChunkHash, StreamId, TreeId};

/// Errors returned by [`Repository`](crate::Repository) operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The repository definitively does not hold this chunk.
    #[error("chunk not found in repository: {0}")]
    ChunkNotFound(ChunkHash),

    /// The repository definitively does not hold this stream.
    #[error("stream not found in repository: {0}")]
    StreamNotFound(StreamId),

    /// The repository definitively does not hold this tree.
    #[error("tree not found in repository: {0}")]
    TreeNotFound(TreeId),

    /// A retryable failure: network error, timeout, rate limiting, 5xx.
    #[error("transient repository failure: {0}")]
    Transient(String),

    /// Chunk bytes did not hash to their key.
    #[error("hash mismatch for chunk {0}")]
    HashMismatch(ChunkHash),

    /// The stream ID is already bound to a different manifest.
    #[error("stream {0} already exists with different content")]
    ImmutableConflict(StreamId),

    /// The repository refused the request for a non-retryable reason.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A manifest failed to decode or validate.
    #[error(transparent)]
    Cas(#[from] CasError),
}

impl RepoError {
    /// Whether the caller may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RepoError::Transient("timeout".into()).is_transient());
        assert!(!RepoError::ChunkNotFound(ChunkHash::from_data(b"x")).is_transient());
        assert!(!RepoError::HashMismatch(ChunkHash::from_data(b"x")).is_transient());
        assert!(!RepoError::Rejected("403".into()).is_transient());
    }
}
