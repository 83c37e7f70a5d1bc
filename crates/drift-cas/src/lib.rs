//! Content addressing, chunking, and stream manifests.
//!
//! This crate provides:
//! - [`Chunker`]: splits data into fixed-size chunks, each identified by its BLAKE3 hash.
//! - [`ChunkReader`]: the same split over an async byte source, one chunk in memory at a time.
//! - [`StreamBuilder`] / [`build_stream`]: construct a [`Stream`](drift_types::Stream)
//!   manifest with a deterministic, content-derived ID.
//! - [`build_tree`]: a [`Tree`](drift_types::Tree) manifest over a directory's
//!   files, subdirectories and symlinks.
//!
//! Manifests are serialized with postcard behind a version byte so builds with
//! different code can still exchange them.

mod chunker;
mod error;
mod manifest;
mod tree;

pub use chunker::{Chunk, ChunkReader, Chunker};
pub use error::CasError;
pub use manifest::{
    StreamBuilder, build_stream, deserialize_stream, serialize_stream, verify_stream,
};
pub use tree::{build_tree, deserialize_tree, serialize_tree, verify_tree};
