//! [`ContentStore`]: deduplicated local storage of chunks and stream manifests.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use drift_cas::verify_stream;
use drift_types::{ChunkHash, Stream, StreamId};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::atomic::parent_dir;
use crate::error::StoreError;
use crate::file_store::FileBlobStore;
use crate::index::StoreIndex;
use crate::locks::{ChunkLease, KeyLocks, PinTable};
use crate::memory_store::MemoryBlobStore;
use crate::traits::BlobStore;

type Result<T> = std::result::Result<T, StoreError>;

/// Result of [`ContentStore::put_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The chunk was new and has been written.
    Stored,
    /// The chunk was already present; nothing was written.
    Deduplicated,
}

/// Point-in-time counters for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Committed streams.
    pub streams: usize,
    /// Chunk blobs held.
    pub chunks: u64,
    /// Bytes held by chunk blobs.
    pub bytes: u64,
    /// Chunks currently pinned by leases.
    pub pinned: usize,
}

/// Local content-addressed store for chunks and stream manifests.
///
/// Chunks live in a [`BlobStore`]; manifests and the chunk reverse index
/// live in a [`StoreIndex`]. A stream is committed only once every chunk
/// it lists is present, and `gc` only reclaims chunks no committed stream
/// references and no [`ChunkLease`] pins.
pub struct ContentStore {
    blobs: Arc<dyn BlobStore>,
    index: StoreIndex,
    locks: KeyLocks,
    pins: Arc<PinTable>,
}

impl ContentStore {
    /// Open a persistent store rooted at `dir`.
    ///
    /// Layout: `dir/chunks/` for blobs, `dir/index/` for the Fjall index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let blobs = FileBlobStore::new(dir.join("chunks"))?;
        let index = StoreIndex::open(dir.join("index"))?;
        info!(path = %dir.display(), "opened content store");
        Ok(Self::with_parts(Arc::new(blobs), index))
    }

    /// Create a volatile store held entirely in memory.
    pub fn in_memory() -> Self {
        Self::with_parts(Arc::new(MemoryBlobStore::new()), StoreIndex::in_memory())
    }

    /// Assemble a store from an explicit blob backend and index.
    pub fn with_parts(blobs: Arc<dyn BlobStore>, index: StoreIndex) -> Self {
        Self {
            blobs,
            index,
            locks: KeyLocks::new(),
            pins: Arc::new(PinTable::default()),
        }
    }

    // ----- Chunks -----

    /// Store a chunk after checking that `data` hashes to `hash`.
    ///
    /// Storing a chunk that is already present is a no-op.
    pub async fn put_chunk(&self, hash: ChunkHash, data: Bytes) -> Result<PutOutcome> {
        let actual = ChunkHash::from_data(&data);
        if actual != hash {
            warn!(expected = %hash, %actual, "rejected chunk with mismatched hash");
            return Err(StoreError::HashMismatch {
                expected: hash,
                actual,
            });
        }

        let _gate = self.pins.gate.read().await;
        let _key = self.locks.lock(&hash).await;

        if self.blobs.contains(hash).await? {
            debug!(%hash, "chunk already present");
            return Ok(PutOutcome::Deduplicated);
        }
        let size = data.len();
        self.blobs.put(hash, data).await?;
        debug!(%hash, size, "stored chunk");
        Ok(PutOutcome::Stored)
    }

    /// Fetch a chunk's bytes.
    pub async fn get_chunk(&self, hash: ChunkHash) -> Result<Bytes> {
        self.blobs
            .get(hash)
            .await?
            .ok_or(StoreError::ChunkNotFound(hash))
    }

    /// Whether a chunk is present.
    pub async fn has_chunk(&self, hash: ChunkHash) -> Result<bool> {
        self.blobs.contains(hash).await
    }

    /// Streams that reference a chunk.
    pub fn chunk_refs(&self, hash: &ChunkHash) -> Result<BTreeSet<StreamId>> {
        self.index.refs(hash)
    }

    // ----- Streams -----

    /// Commit a manifest.
    ///
    /// Every chunk the stream lists must already be present; otherwise the
    /// commit is refused with [`StoreError::IncompleteStream`]. The manifest
    /// and its back-references are recorded under the same locks, so a
    /// concurrent `gc` sees either neither or both.
    pub async fn put_stream(&self, stream: &Stream) -> Result<()> {
        verify_stream(stream)?;
        let unique = stream.unique_chunks();

        let _gate = self.pins.gate.read().await;
        let _keys = self.locks.lock_many(&unique).await;

        if let Some(existing) = self.index.get_stream(&stream.id)? {
            if existing == *stream {
                debug!(stream_id = %stream.id, "stream already committed");
                return Ok(());
            }
            return Err(StoreError::ImmutableConflict(stream.id));
        }

        let mut missing = Vec::new();
        for hash in &unique {
            if !self.blobs.contains(*hash).await? {
                missing.push(*hash);
            }
        }
        if !missing.is_empty() {
            warn!(stream_id = %stream.id, missing = missing.len(), "refusing incomplete stream");
            return Err(StoreError::IncompleteStream {
                stream: stream.id,
                missing,
            });
        }

        self.index.put_stream(stream)?;
        info!(
            stream_id = %stream.id,
            chunks = stream.chunks.len(),
            size = stream.meta.size,
            "committed stream"
        );
        Ok(())
    }

    /// Fetch a committed manifest.
    pub fn get_stream(&self, id: &StreamId) -> Result<Stream> {
        self.index
            .get_stream(id)?
            .ok_or(StoreError::StreamNotFound(*id))
    }

    /// Whether a manifest with this ID is committed.
    pub fn has_stream(&self, id: &StreamId) -> Result<bool> {
        self.index.has_stream(id)
    }

    /// IDs of all committed streams, ascending.
    pub fn list_streams(&self) -> Result<Vec<StreamId>> {
        self.index.list_streams()
    }

    /// Drop a committed manifest. Its chunks become reclaimable unless
    /// another stream references them.
    pub async fn remove_stream(&self, id: &StreamId) -> Result<Stream> {
        let stream = self.get_stream(id)?;
        let unique = stream.unique_chunks();

        let _gate = self.pins.gate.read().await;
        let _keys = self.locks.lock_many(&unique).await;

        let removed = self
            .index
            .remove_stream(id)?
            .ok_or(StoreError::StreamNotFound(*id))?;
        info!(stream_id = %id, "removed stream");
        Ok(removed)
    }

    // ----- Leases & gc -----

    /// Pin `hashes` against garbage collection until the lease is dropped.
    pub async fn lease(&self, hashes: impl IntoIterator<Item = ChunkHash>) -> ChunkLease {
        ChunkLease::acquire(self.pins.clone(), hashes).await
    }

    /// Reclaim every chunk that no committed stream references and no lease
    /// pins. Returns the number of chunks deleted.
    ///
    /// Runs with the store's gate held exclusively, so no commit, removal,
    /// chunk write or lease acquisition interleaves with the sweep.
    pub async fn gc(&self) -> Result<usize> {
        let _gate = self.pins.gate.write().await;

        let mut reclaimed = 0;
        for hash in self.blobs.list().await? {
            if self.pins.is_pinned(&hash) || self.index.is_referenced(&hash)? {
                continue;
            }
            self.blobs.delete(hash).await?;
            debug!(%hash, "reclaimed chunk");
            reclaimed += 1;
        }

        info!(reclaimed, "garbage collection complete");
        Ok(reclaimed)
    }

    /// Current counters.
    pub async fn stats(&self) -> Result<StoreStats> {
        let usage = self.blobs.usage().await?;
        Ok(StoreStats {
            streams: self.index.list_streams()?.len(),
            chunks: usage.chunks,
            bytes: usage.bytes,
            pinned: self.pins.pinned(),
        })
    }

    // ----- Reassembly -----

    /// Reassemble a committed stream into a file at `dest`.
    ///
    /// Every chunk is re-hashed and length-checked before it is written.
    /// The file is written to a temporary sibling and renamed into place,
    /// then given the recorded mode and mtime. Returns the bytes written.
    pub async fn materialize(&self, id: &StreamId, dest: &Path) -> Result<u64> {
        let stream = self.get_stream(id)?;

        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (file, tmp_path) = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".drift-tmp")
            .tempfile_in(parent_dir(dest))?
            .into_parts();

        // Dropping `tmp_path` on any error below removes the partial file.
        let written = self
            .write_chunks(&stream, tokio::fs::File::from_std(file))
            .await?;
        set_mode(&tmp_path, stream.meta.mode).await?;
        tmp_path.persist(dest).map_err(|e| e.error)?;

        info!(stream_id = %id, path = %dest.display(), size = written, "materialized stream");
        Ok(written)
    }

    async fn write_chunks(&self, stream: &Stream, mut file: tokio::fs::File) -> Result<u64> {
        let mut written = 0u64;

        for (i, hash) in stream.chunks.iter().enumerate() {
            let data = self.get_chunk(*hash).await?;
            let actual = ChunkHash::from_data(&data);
            if actual != *hash {
                return Err(StoreError::Corrupt {
                    expected: *hash,
                    actual,
                });
            }
            let expected_len = stream.chunk_len(i).unwrap_or_default();
            if data.len() as u64 != expected_len {
                return Err(StoreError::Cas(drift_cas::CasError::ChunkLayout(format!(
                    "chunk {hash} at index {i} has {} bytes, expected {expected_len}",
                    data.len()
                ))));
            }
            file.write_all(&data).await?;
            written += data.len() as u64;
        }

        file.flush().await?;
        let file = file.into_std().await;
        let mtime = UNIX_EPOCH + Duration::from_secs(stream.meta.mtime);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            file.set_modified(mtime)?;
            file.sync_all()
        })
        .await
        .map_err(std::io::Error::other)??;

        Ok(written)
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if mode != 0 {
        let perms = std::fs::Permissions::from_mode(mode & 0o7777);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
