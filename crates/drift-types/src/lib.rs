//! Shared types and identifiers for drift.
//!
//! This crate defines the core types used across the drift workspace:
//! identifiers ([`ChunkHash`], [`StreamId`], [`TreeId`]), the [`Stream`]
//! manifest and its [`FileMeta`], the [`Tree`] directory manifest, and
//! configuration ([`SyncConfig`], [`StorageBackend`]).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed chunk size: every chunk of a stream is exactly this long except the last.
pub const CHUNK_SIZE: u32 = 4_194_304;

/// Manifest envelope version understood by this build.
pub const MANIFEST_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Error returned when parsing a hex identifier fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier {input:?}: expected 64 hex characters")]
pub struct ParseIdError {
    /// The rejected input.
    pub input: String,
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl From<blake3::Hash> for $name {
            fn from(hash: blake3::Hash) -> Self {
                Self(hash.into())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_hex32(s)
                    .map(Self)
                    .ok_or_else(|| ParseIdError { input: s.to_string() })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Content-addressed identifier for a chunk: `blake3(chunk_bytes)`.
    ChunkHash
);

define_id!(
    /// Content-addressed identifier for a stream: `blake3(serialized_stream_content)`.
    StreamId
);

define_id!(
    /// Content-addressed identifier for a directory tree: `blake3(serialized_tree_content)`.
    TreeId
);

/// Decode exactly 64 hex characters into 32 bytes.
fn decode_hex32(hex: &str) -> Option<[u8; 32]> {
    let raw = hex.as_bytes();
    if raw.len() != 64 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = (hex_nibble(raw[i * 2])? << 4) | hex_nibble(raw[i * 2 + 1])?;
    }
    Some(bytes)
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Stream manifest
// ---------------------------------------------------------------------------

/// File-level metadata carried by a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMeta {
    /// Original file size in bytes.
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: u64,
    /// Path relative to the pushed root, if the stream came from a file tree.
    pub path: Option<String>,
}

/// Ordered chunk list plus metadata, identifying a reconstructable file.
///
/// Concatenating the chunks in order reproduces the file. Every chunk is
/// exactly `chunk_size` bytes except the last, which may be shorter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Envelope format version.
    pub version: u8,
    /// Content-derived identifier, see `drift_cas::build_stream`.
    pub id: StreamId,
    /// Chunk size used when splitting.
    pub chunk_size: u32,
    /// Chunk hashes in file order. May contain repeats.
    pub chunks: Vec<ChunkHash>,
    /// File metadata.
    pub meta: FileMeta,
}

impl Stream {
    /// Expected byte length of the chunk at `index`, or `None` if out of range.
    pub fn chunk_len(&self, index: usize) -> Option<u64> {
        if index >= self.chunks.len() {
            return None;
        }
        let full = u64::from(self.chunk_size);
        if index + 1 < self.chunks.len() {
            return Some(full);
        }
        let before = full * index as u64;
        Some(self.meta.size.saturating_sub(before))
    }

    /// Distinct chunk hashes referenced by this stream.
    pub fn unique_chunks(&self) -> BTreeSet<ChunkHash> {
        self.chunks.iter().copied().collect()
    }

    /// Whether this stream describes a zero-byte file.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tree manifest
// ---------------------------------------------------------------------------

/// What a [`TreeEntry`] recreates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A regular file, reassembled from a stream.
    File(StreamId),
    /// A directory, possibly empty.
    Dir,
    /// A symbolic link with its target exactly as read from disk.
    Symlink(String),
}

/// One path inside a [`Tree`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the tree root, `/`-separated, no `.` or `..`.
    pub path: String,
    /// Unix permission bits. Ignored for symlinks.
    pub mode: u32,
    pub kind: EntryKind,
}

/// A directory snapshot: every file, directory and symlink under a root,
/// sorted by path. Files reference their streams by ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Envelope format version.
    pub version: u8,
    /// Content-derived identifier, see `drift_cas::build_tree`.
    pub id: TreeId,
    /// Permission bits of the root directory itself.
    pub root_mode: u32,
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Stream IDs of every file entry, in path order.
    pub fn streams(&self) -> impl Iterator<Item = (&str, StreamId)> + '_ {
        self.entries.iter().filter_map(|e| match e.kind {
            EntryKind::File(id) => Some((e.path.as_str(), id)),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Local store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory storage (volatile, for testing).
    Memory,
    /// File-based storage with one file per chunk.
    File,
}

/// Tuning for push/pull runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum concurrent chunk transfers.
    pub concurrency: usize,
    /// Retries per chunk operation after a transient failure.
    pub max_retries: u32,
    /// First backoff delay in milliseconds; doubled per attempt.
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub retry_max_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_retries: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
