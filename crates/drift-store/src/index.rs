//! Persistent stream index: committed manifests plus the chunk reverse index.
//!
//! Two mappings are kept, either in Fjall keyspaces or in memory:
//! - `streams`: `StreamId` → postcard-encoded [`Stream`]
//! - `refs`: `ChunkHash` → postcard-encoded set of referencing `StreamId`s
//!
//! Manifests are the source of truth. Opening a persistent index rebuilds
//! `refs` from them, so a crash between the two writes is harmless.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::RwLock;

use drift_cas::{deserialize_stream, serialize_stream};
use drift_types::{ChunkHash, Stream, StreamId};
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tracing::{debug, info};

use crate::error::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        streams: Keyspace,
        refs: Keyspace,
        /// Keeps a temporary index's directory alive.
        _tmp: Option<tempfile::TempDir>,
    },
    Memory(Box<MemoryBackend>),
}

#[derive(Default)]
struct MemoryBackend {
    streams: RwLock<HashMap<StreamId, Stream>>,
    refs: RwLock<HashMap<ChunkHash, BTreeSet<StreamId>>>,
}

fn index_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Index(e.to_string())
}

/// Index of committed streams and the chunks they reference.
///
/// Callers serialize updates touching the same chunk (the
/// [`ContentStore`](crate::ContentStore) does this with its key locks).
pub struct StoreIndex {
    backend: Backend,
}

impl StoreIndex {
    /// Open a persistent index at the given path and rebuild its reverse index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(index_err)?;
        let index = Self {
            backend: Self::init_fjall(db, None)?,
        };
        index.rebuild_refs()?;
        Ok(index)
    }

    /// Open a temporary Fjall index that is cleaned up on drop.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path())
            .temporary(true)
            .open()
            .map_err(index_err)?;
        Ok(Self {
            backend: Self::init_fjall(db, Some(tmp))?,
        })
    }

    /// Create a pure in-memory index.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Box::default()),
        }
    }

    fn init_fjall(db: Database, tmp: Option<tempfile::TempDir>) -> Result<Backend> {
        let streams = db
            .keyspace("streams", KeyspaceCreateOptions::default)
            .map_err(index_err)?;
        let refs = db
            .keyspace("refs", KeyspaceCreateOptions::default)
            .map_err(index_err)?;
        Ok(Backend::Fjall {
            db,
            streams,
            refs,
            _tmp: tmp,
        })
    }

    // ----- Streams -----

    /// Record a manifest and add its chunks' back-references.
    pub fn put_stream(&self, stream: &Stream) -> Result<()> {
        match &self.backend {
            Backend::Fjall { streams, .. } => {
                let bytes = serialize_stream(stream)?;
                streams
                    .insert(stream.id.as_bytes(), bytes)
                    .map_err(index_err)?;
            }
            Backend::Memory(m) => {
                m.streams
                    .write()
                    .expect("lock poisoned")
                    .insert(stream.id, stream.clone());
            }
        }
        for hash in stream.unique_chunks() {
            self.update_refs(&hash, |set| {
                set.insert(stream.id);
            })?;
        }
        debug!(stream_id = %stream.id, chunks = stream.chunks.len(), "indexed stream");
        Ok(())
    }

    /// Retrieve a manifest by ID.
    pub fn get_stream(&self, id: &StreamId) -> Result<Option<Stream>> {
        match &self.backend {
            Backend::Fjall { streams, .. } => match streams.get(id.as_bytes()).map_err(index_err)? {
                Some(bytes) => Ok(Some(deserialize_stream(&bytes)?)),
                None => Ok(None),
            },
            Backend::Memory(m) => Ok(m.streams.read().expect("lock poisoned").get(id).cloned()),
        }
    }

    /// Whether a manifest with this ID is recorded.
    pub fn has_stream(&self, id: &StreamId) -> Result<bool> {
        match &self.backend {
            Backend::Fjall { streams, .. } => {
                Ok(streams.get(id.as_bytes()).map_err(index_err)?.is_some())
            }
            Backend::Memory(m) => Ok(m.streams.read().expect("lock poisoned").contains_key(id)),
        }
    }

    /// All recorded stream IDs, in ascending order.
    pub fn list_streams(&self) -> Result<Vec<StreamId>> {
        let mut ids = match &self.backend {
            Backend::Fjall { streams, .. } => {
                let mut ids = Vec::new();
                for guard in streams.iter() {
                    let key = guard.key().map_err(index_err)?;
                    ids.push(id_from_key::<StreamId>(&key)?);
                }
                ids
            }
            Backend::Memory(m) => m
                .streams
                .read()
                .expect("lock poisoned")
                .keys()
                .copied()
                .collect(),
        };
        ids.sort();
        Ok(ids)
    }

    /// Drop a manifest and its back-references. Returns the removed manifest.
    pub fn remove_stream(&self, id: &StreamId) -> Result<Option<Stream>> {
        let Some(stream) = self.get_stream(id)? else {
            return Ok(None);
        };
        match &self.backend {
            Backend::Fjall { streams, .. } => {
                streams.remove(id.as_bytes()).map_err(index_err)?;
            }
            Backend::Memory(m) => {
                m.streams.write().expect("lock poisoned").remove(id);
            }
        }
        for hash in stream.unique_chunks() {
            self.update_refs(&hash, |set| {
                set.remove(id);
            })?;
        }
        debug!(stream_id = %id, "removed stream from index");
        Ok(Some(stream))
    }

    // ----- Reverse index -----

    /// Streams that reference a chunk.
    pub fn refs(&self, hash: &ChunkHash) -> Result<BTreeSet<StreamId>> {
        match &self.backend {
            Backend::Fjall { refs, .. } => match refs.get(hash.as_bytes()).map_err(index_err)? {
                Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
                None => Ok(BTreeSet::new()),
            },
            Backend::Memory(m) => Ok(m
                .refs
                .read()
                .expect("lock poisoned")
                .get(hash)
                .cloned()
                .unwrap_or_default()),
        }
    }

    /// Whether any committed stream references a chunk.
    pub fn is_referenced(&self, hash: &ChunkHash) -> Result<bool> {
        Ok(!self.refs(hash)?.is_empty())
    }

    fn update_refs(&self, hash: &ChunkHash, f: impl FnOnce(&mut BTreeSet<StreamId>)) -> Result<()> {
        match &self.backend {
            Backend::Fjall { .. } => {
                let mut set = self.refs(hash)?;
                f(&mut set);
                self.write_refs(hash, &set)
            }
            Backend::Memory(m) => {
                let mut map = m.refs.write().expect("lock poisoned");
                let set = map.entry(*hash).or_default();
                f(set);
                if set.is_empty() {
                    map.remove(hash);
                }
                Ok(())
            }
        }
    }

    fn write_refs(&self, hash: &ChunkHash, set: &BTreeSet<StreamId>) -> Result<()> {
        if let Backend::Fjall { refs, .. } = &self.backend {
            if set.is_empty() {
                refs.remove(hash.as_bytes()).map_err(index_err)?;
            } else {
                let bytes = postcard::to_allocvec(set)?;
                refs.insert(hash.as_bytes(), bytes).map_err(index_err)?;
            }
        }
        Ok(())
    }

    /// Recompute the reverse index from the recorded manifests.
    ///
    /// Returns the number of distinct chunks referenced.
    pub fn rebuild_refs(&self) -> Result<usize> {
        let mut rebuilt: HashMap<ChunkHash, BTreeSet<StreamId>> = HashMap::new();
        for id in self.list_streams()? {
            if let Some(stream) = self.get_stream(&id)? {
                for hash in stream.unique_chunks() {
                    rebuilt.entry(hash).or_default().insert(id);
                }
            }
        }

        match &self.backend {
            Backend::Fjall { refs, .. } => {
                let mut stale = Vec::new();
                for guard in refs.iter() {
                    let key = guard.key().map_err(index_err)?;
                    let hash = id_from_key::<ChunkHash>(&key)?;
                    if !rebuilt.contains_key(&hash) {
                        stale.push(hash);
                    }
                }
                for hash in &stale {
                    refs.remove(hash.as_bytes()).map_err(index_err)?;
                }
                for (hash, set) in &rebuilt {
                    self.write_refs(hash, set)?;
                }
            }
            Backend::Memory(m) => {
                *m.refs.write().expect("lock poisoned") = rebuilt.clone();
            }
        }

        info!(chunks = rebuilt.len(), "rebuilt chunk reverse index");
        Ok(rebuilt.len())
    }
}

fn id_from_key<T: From<[u8; 32]>>(key: &[u8]) -> Result<T> {
    let arr: [u8; 32] = key
        .try_into()
        .map_err(|_| StoreError::Index(format!("malformed index key of {} bytes", key.len())))?;
    Ok(T::from(arr))
}

#[cfg(test)]
mod tests {
    use drift_cas::build_stream;
    use drift_types::FileMeta;

    use super::*;

    fn stream_of(chunks: &[&[u8]], mode: u32) -> Stream {
        let hashes: Vec<ChunkHash> = chunks.iter().map(|c| ChunkHash::from_data(c)).collect();
        let size = hashes.len() as u64 * 4;
        build_stream(
            4,
            hashes,
            FileMeta {
                size,
                mode,
                ..FileMeta::default()
            },
        )
        .unwrap()
    }

    fn backends() -> Vec<StoreIndex> {
        vec![StoreIndex::in_memory(), StoreIndex::open_temporary().unwrap()]
    }

    #[test]
    fn test_put_get_stream() {
        for index in backends() {
            let stream = stream_of(&[b"aaaa", b"bbbb"], 0o644);
            index.put_stream(&stream).unwrap();
            assert_eq!(index.get_stream(&stream.id).unwrap(), Some(stream.clone()));
            assert!(index.has_stream(&stream.id).unwrap());
        }
    }

    #[test]
    fn test_get_missing_stream() {
        for index in backends() {
            let id = StreamId::from_data(b"nothing");
            assert_eq!(index.get_stream(&id).unwrap(), None);
            assert!(!index.has_stream(&id).unwrap());
        }
    }

    #[test]
    fn test_refs_track_sharing_streams() {
        for index in backends() {
            let a = stream_of(&[b"aaaa", b"shar"], 0o644);
            let b = stream_of(&[b"shar", b"bbbb"], 0o644);
            index.put_stream(&a).unwrap();
            index.put_stream(&b).unwrap();

            let shared = ChunkHash::from_data(b"shar");
            let refs = index.refs(&shared).unwrap();
            assert_eq!(refs.len(), 2);
            assert!(refs.contains(&a.id) && refs.contains(&b.id));

            index.remove_stream(&a.id).unwrap();
            assert_eq!(index.refs(&shared).unwrap().len(), 1);
            assert!(!index.is_referenced(&ChunkHash::from_data(b"aaaa")).unwrap());
        }
    }

    #[test]
    fn test_repeated_chunk_counts_once_per_stream() {
        for index in backends() {
            let s = stream_of(&[b"same", b"same", b"same"], 0o644);
            index.put_stream(&s).unwrap();
            assert_eq!(index.refs(&ChunkHash::from_data(b"same")).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_list_streams_sorted() {
        for index in backends() {
            let mut ids = Vec::new();
            for mode in [0o600, 0o644, 0o755] {
                let s = stream_of(&[b"xxxx"], mode);
                index.put_stream(&s).unwrap();
                ids.push(s.id);
            }
            ids.sort();
            assert_eq!(index.list_streams().unwrap(), ids);
        }
    }

    #[test]
    fn test_remove_missing_stream_is_none() {
        for index in backends() {
            assert!(
                index
                    .remove_stream(&StreamId::from_data(b"gone"))
                    .unwrap()
                    .is_none()
            );
        }
    }

    #[test]
    fn test_reopen_rebuilds_refs() {
        let dir = tempfile::tempdir().unwrap();
        let stream = stream_of(&[b"keep", b"this"], 0o644);
        {
            let index = StoreIndex::open(dir.path()).unwrap();
            index.put_stream(&stream).unwrap();
            // Simulate a stale entry left by an interrupted removal.
            index
                .write_refs(
                    &ChunkHash::from_data(b"junk"),
                    &BTreeSet::from([StreamId::from_data(b"dead")]),
                )
                .unwrap();
        }

        let index = StoreIndex::open(dir.path()).unwrap();
        assert_eq!(index.get_stream(&stream.id).unwrap(), Some(stream.clone()));
        assert!(index.is_referenced(&ChunkHash::from_data(b"keep")).unwrap());
        assert!(!index.is_referenced(&ChunkHash::from_data(b"junk")).unwrap());
        assert_eq!(index.rebuild_refs().unwrap(), 2);
    }
}
