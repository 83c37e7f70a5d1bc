//! Fixed-size chunker for splitting data into content-addressed chunks.
//!
//! Boundaries fall every `chunk_size` bytes. An edit near the start of a file
//! shifts every later boundary, so such files share no chunks with their
//! previous version; mostly-append and whole-file-replace workloads dedup well.

use std::io::SeekFrom;

use bytes::Bytes;
use drift_types::{CHUNK_SIZE, ChunkHash};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::error::CasError;

/// A single chunk of data with its content-addressed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Content-addressed identifier: `blake3(data)`.
    pub hash: ChunkHash,
    /// Byte offset within the original source.
    pub offset: u64,
    /// The raw chunk data.
    pub data: Bytes,
}

impl Chunk {
    /// Re-hash the data and compare it to `hash`.
    pub fn verify(&self) -> bool {
        ChunkHash::from_data(&self.data) == self.hash
    }
}

/// Fixed-size chunker that splits data into chunks of a configured size.
///
/// The last chunk may be smaller than `chunk_size`.
/// Empty data produces zero chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: u32,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(CHUNK_SIZE)
    }
}

impl Chunker {
    /// Create a new chunker with the given chunk size in bytes, clamped to
    /// `1..=CHUNK_SIZE`.
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, CHUNK_SIZE),
        }
    }

    /// The configured chunk size.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Split in-memory data into fixed-size chunks.
    pub fn chunk(&self, data: &[u8]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut offset = 0u64;

        for slice in data.chunks(self.chunk_size as usize) {
            chunks.push(Chunk {
                hash: ChunkHash::from_data(slice),
                offset,
                data: Bytes::copy_from_slice(slice),
            });
            offset += slice.len() as u64;
        }

        chunks
    }

    /// Wrap an async byte source in a lazy [`ChunkReader`].
    pub fn reader<R: AsyncRead + Unpin>(&self, reader: R) -> ChunkReader<R> {
        ChunkReader {
            reader,
            chunk_size: self.chunk_size as usize,
            offset: 0,
            exhausted: false,
        }
    }
}

/// Lazily splits an async byte source into chunks.
///
/// Each call to [`next_chunk`](Self::next_chunk) reads at most one chunk,
/// hashing bytes as they arrive, so memory use is bounded by `chunk_size`.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Read the next chunk, or `None` at end of input.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, CasError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut hasher = blake3::Hasher::new();
        let mut filled = 0;

        // Fill a whole chunk unless the source ends first.
        while filled < self.chunk_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            hasher.update(&buf[filled..filled + n]);
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        let chunk = Chunk {
            hash: ChunkHash::from(hasher.finalize()),
            offset: self.offset,
            data: Bytes::from(buf),
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// Total bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin> ChunkReader<R> {
    /// Restart the sequence from the beginning of the source.
    pub async fn rewind(&mut self) -> Result<(), CasError> {
        self.reader.seek(SeekFrom::Start(0)).await?;
        self.offset = 0;
        self.exhausted = false;
        Ok(())
    }
}
