//! Error types for the local content store.

use drift_cas::CasError;
use drift_types::{ChunkHash, StreamId};

/// Errors that can occur during content store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested chunk is not in the store.
    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkHash),

    /// No stream with this ID has been committed.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Bytes handed to `put_chunk` do not hash to the key they were offered under.
    #[error("hash mismatch: expected {expected}, data hashes to {actual}")]
    HashMismatch {
        /// The key the caller supplied.
        expected: ChunkHash,
        /// The hash of the bytes actually supplied.
        actual: ChunkHash,
    },

    /// Chunk data at rest does not match its content-addressed key.
    ///
    /// The chunk is never returned to the caller.
    #[error("chunk corruption detected: expected {expected}, actual hash {actual}")]
    Corrupt {
        /// The hash that was requested.
        expected: ChunkHash,
        /// The hash computed from the data actually stored.
        actual: ChunkHash,
    },

    /// A manifest commit referenced chunks the store does not hold.
    #[error("stream {stream} references {} missing chunks", .missing.len())]
    IncompleteStream {
        /// The stream whose commit was refused.
        stream: StreamId,
        /// Chunks that are absent.
        missing: Vec<ChunkHash>,
    },

    /// A stream ID is already bound to a different manifest.
    #[error("stream {0} already exists with different content")]
    ImmutableConflict(StreamId),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistent index failed.
    #[error("index error: {0}")]
    Index(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// Manifest validation failed.
    #[error(transparent)]
    Cas(#[from] CasError),
}
