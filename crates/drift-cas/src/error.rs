//! Error types for content addressing operations.

use drift_types::{StreamId, TreeId};

/// Errors that can occur during chunking and manifest handling.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred while reading the source.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest has an unsupported version.
    #[error("unsupported manifest version {found}, this build supports version {supported}")]
    UnsupportedVersion {
        /// Version found in the manifest.
        found: u8,
        /// Version this build supports.
        supported: u8,
    },

    /// Chunks do not follow the fixed-size layout.
    #[error("invalid chunk layout: {0}")]
    ChunkLayout(String),

    /// The bytes seen by the builder disagree with the declared file size.
    #[error("size mismatch: metadata declares {declared} bytes, chunks hold {actual}")]
    SizeMismatch {
        /// Size from the caller's metadata.
        declared: u64,
        /// Sum of chunk lengths.
        actual: u64,
    },

    /// The stream's ID does not match its content.
    #[error("stream id mismatch: manifest claims {claimed}, content hashes to {actual}")]
    StreamIdMismatch {
        /// ID carried by the manifest.
        claimed: StreamId,
        /// ID recomputed from the manifest content.
        actual: StreamId,
    },

    /// The tree's ID does not match its content.
    #[error("tree id mismatch: manifest claims {claimed}, content hashes to {actual}")]
    TreeIdMismatch {
        /// ID carried by the manifest.
        claimed: TreeId,
        /// ID recomputed from the manifest content.
        actual: TreeId,
    },

    /// A tree entry has an unsafe or conflicting path.
    #[error("invalid tree entry {path:?}: {reason}")]
    InvalidEntry {
        path: String,
        reason: &'static str,
    },
}
