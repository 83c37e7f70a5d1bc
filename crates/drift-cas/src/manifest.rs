//! Stream building and serialization.
//!
//! A [`Stream`] lists a file's chunk hashes in order plus its [`FileMeta`].
//! Its [`StreamId`] is `blake3(postcard(content))` over the chunk size, the
//! chunk list and the metadata, so identical content always yields the same ID.

use drift_types::{CHUNK_SIZE, ChunkHash, FileMeta, MANIFEST_VERSION, Stream, StreamId};
use serde::Serialize;

use crate::chunker::Chunk;
use crate::error::CasError;

/// Manifest content the ID is derived from.
///
/// The version is excluded so that bumping the envelope format doesn't
/// change existing IDs.
#[derive(Serialize)]
struct StreamContent<'a> {
    chunk_size: u32,
    chunks: &'a [ChunkHash],
    meta: &'a FileMeta,
}

fn stream_id(chunk_size: u32, chunks: &[ChunkHash], meta: &FileMeta) -> Result<StreamId, CasError> {
    let content = StreamContent {
        chunk_size,
        chunks,
        meta,
    };
    let serialized =
        postcard::to_allocvec(&content).map_err(|e| CasError::Serialization(e.to_string()))?;
    Ok(StreamId::from_data(&serialized))
}

/// Build a [`Stream`] from an ordered chunk list and file metadata.
///
/// A zero-byte file produces a valid stream with no chunks.
pub fn build_stream(
    chunk_size: u32,
    chunks: Vec<ChunkHash>,
    meta: FileMeta,
) -> Result<Stream, CasError> {
    check_layout(chunk_size, chunks.len(), meta.size)?;
    let id = stream_id(chunk_size, &chunks, &meta)?;
    Ok(Stream {
        version: MANIFEST_VERSION,
        id,
        chunk_size,
        chunks,
        meta,
    })
}

/// Check that a stream's chunk count fits its size and its ID fits its content.
pub fn verify_stream(stream: &Stream) -> Result<(), CasError> {
    check_layout(stream.chunk_size, stream.chunks.len(), stream.meta.size)?;
    let actual = stream_id(stream.chunk_size, &stream.chunks, &stream.meta)?;
    if actual != stream.id {
        return Err(CasError::StreamIdMismatch {
            claimed: stream.id,
            actual,
        });
    }
    Ok(())
}

fn check_layout(chunk_size: u32, chunk_count: usize, size: u64) -> Result<(), CasError> {
    if chunk_size == 0 {
        return Err(CasError::ChunkLayout("chunk size must be non-zero".into()));
    }
    if chunk_size > CHUNK_SIZE {
        return Err(CasError::ChunkLayout(format!(
            "chunk size {chunk_size} exceeds the {CHUNK_SIZE} byte limit"
        )));
    }
    let expected = size.div_ceil(u64::from(chunk_size));
    if expected != chunk_count as u64 {
        return Err(CasError::ChunkLayout(format!(
            "{size} bytes at {chunk_size} bytes per chunk needs {expected} chunks, got {chunk_count}"
        )));
    }
    Ok(())
}

/// Serialize a stream to postcard bytes.
pub fn serialize_stream(stream: &Stream) -> Result<Vec<u8>, CasError> {
    postcard::to_allocvec(stream).map_err(|e| CasError::Serialization(e.to_string()))
}

/// Deserialize and verify a stream from postcard bytes.
///
/// Rejects unknown versions before anything else is interpreted, then checks
/// that the ID matches the content.
pub fn deserialize_stream(bytes: &[u8]) -> Result<Stream, CasError> {
    let stream: Stream =
        postcard::from_bytes(bytes).map_err(|e| CasError::Serialization(e.to_string()))?;
    if stream.version != MANIFEST_VERSION {
        return Err(CasError::UnsupportedVersion {
            found: stream.version,
            supported: MANIFEST_VERSION,
        });
    }
    verify_stream(&stream)?;
    Ok(stream)
}

/// Accumulates chunks in order and produces a [`Stream`].
pub struct StreamBuilder {
    chunk_size: u32,
    chunks: Vec<ChunkHash>,
    total: u64,
    saw_short: bool,
}

impl StreamBuilder {
    /// Start a stream for chunks of `chunk_size` bytes, clamped to
    /// `1..=CHUNK_SIZE`.
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, CHUNK_SIZE),
            chunks: Vec::new(),
            total: 0,
            saw_short: false,
        }
    }

    /// Append the next chunk in file order.
    pub fn push(&mut self, chunk: &Chunk) -> Result<(), CasError> {
        self.push_hash(chunk.hash, chunk.data.len() as u64)
    }

    /// Append a chunk by hash and length.
    pub fn push_hash(&mut self, hash: ChunkHash, len: u64) -> Result<(), CasError> {
        if len == 0 || len > u64::from(self.chunk_size) {
            return Err(CasError::ChunkLayout(format!(
                "chunk {hash} has {len} bytes, limit is {}",
                self.chunk_size
            )));
        }
        if self.saw_short {
            return Err(CasError::ChunkLayout(format!(
                "chunk {hash} follows a short chunk"
            )));
        }
        if len < u64::from(self.chunk_size) {
            self.saw_short = true;
        }
        self.chunks.push(hash);
        self.total += len;
        Ok(())
    }

    /// Bytes accumulated so far.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Finish the stream. `meta.size` must equal the bytes pushed.
    pub fn finish(self, meta: FileMeta) -> Result<Stream, CasError> {
        if meta.size != self.total {
            return Err(CasError::SizeMismatch {
                declared: meta.size,
                actual: self.total,
            });
        }
        build_stream(self.chunk_size, self.chunks, meta)
    }
}
