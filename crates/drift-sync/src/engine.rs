//! [`SyncEngine`]: computes minimal chunk transfers between a local
//! [`ContentStore`] and a remote [`Repository`] and commits manifests
//! only after every chunk they list is present at the destination.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use drift_cas::{Chunker, StreamBuilder, build_tree, verify_stream, verify_tree};
use drift_repo::Repository;
use drift_store::ContentStore;
use drift_types::{
    ChunkHash, EntryKind, FileMeta, Stream, StreamId, SyncConfig, Tree, TreeEntry, TreeId,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{SyncError, SyncFailure};
use crate::phase::{Direction, StatusReport, SyncPhase, SyncReport, TreeReport};
use crate::retry::RetryPolicy;
use crate::walk::{NodeKind, mode_bits, regular_files, relative_name, scan_tree};

/// Result of a single push or pull.
pub type SyncResult = Result<SyncReport, SyncFailure>;

/// Drives push, pull and status between one store and one repository.
///
/// Handles are passed in explicitly; several engines may share a store or
/// a repository.
pub struct SyncEngine {
    store: Arc<ContentStore>,
    repo: Arc<dyn Repository>,
    config: SyncConfig,
    retry: RetryPolicy,
    chunker: Chunker,
}

impl SyncEngine {
    /// Create an engine using the default 4 MiB chunker.
    pub fn new(store: Arc<ContentStore>, repo: Arc<dyn Repository>, config: SyncConfig) -> Self {
        Self {
            store,
            repo,
            retry: RetryPolicy::from(&config),
            config,
            chunker: Chunker::default(),
        }
    }

    /// Use a different chunker for imports and status.
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    /// The local store.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// The remote repository.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    // ----- Local import -----

    /// Chunk a file into the local store and commit its stream.
    ///
    /// The recorded path is relative to `root`, or the bare file name when
    /// `root` is `None`. Chunks are leased as they are written so a
    /// concurrent gc cannot reclaim them before the commit.
    pub async fn import_file(&self, path: &Path, root: Option<&Path>) -> Result<Stream, SyncError> {
        let (file, meta) = open_source(path, root).await?;
        let mut reader = self.chunker.reader(file);
        let mut builder = StreamBuilder::new(self.chunker.chunk_size());
        let mut lease = self.store.lease([]).await;

        while let Some(chunk) = reader.next_chunk().await? {
            lease.extend([chunk.hash]).await;
            self.store.put_chunk(chunk.hash, chunk.data.clone()).await?;
            builder.push(&chunk)?;
        }

        let stream = builder.finish(meta)?;
        self.store.put_stream(&stream).await?;
        drop(lease);

        debug!(
            stream_id = %stream.id,
            path = %path.display(),
            chunks = stream.chunks.len(),
            "imported file"
        );
        Ok(stream)
    }

    /// Compute the stream a file would produce without writing anything.
    async fn scan_file(&self, path: &Path, root: Option<&Path>) -> Result<Stream, SyncError> {
        let (file, meta) = open_source(path, root).await?;
        let mut reader = self.chunker.reader(file);
        let mut builder = StreamBuilder::new(self.chunker.chunk_size());
        while let Some(chunk) = reader.next_chunk().await? {
            builder.push(&chunk)?;
        }
        Ok(builder.finish(meta)?)
    }

    // ----- Push -----

    /// Push a locally committed stream to the repository.
    ///
    /// Queries `has_chunk` for every distinct chunk, uploads the missing
    /// ones (digest checked before upload), and publishes the manifest
    /// only once every chunk is confirmed remote.
    pub async fn push_stream(&self, id: StreamId, cancel: &CancelToken) -> SyncResult {
        let mut report = SyncReport::new(Direction::Push, Some(id));
        match self.run_push(id, cancel, &mut report).await {
            Ok(()) => Ok(self.finish(report)),
            Err(error) => Err(self.fail(report, error)),
        }
    }

    async fn run_push(
        &self,
        id: StreamId,
        cancel: &CancelToken,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        report.phase = SyncPhase::Planning;
        cancel.check()?;
        let stream = self.store.get_stream(&id)?;
        let unique = stream.unique_chunks();
        // Keeps a concurrent remove_stream + gc from pulling chunks out
        // from under the upload.
        let _lease = self.store.lease(unique.iter().copied()).await;

        let probes = self
            .for_each_chunk(unique.iter().copied().collect(), cancel, {
                let repo = self.repo.clone();
                let retry = self.retry;
                let cancel = cancel.clone();
                move |hash| {
                    let repo = repo.clone();
                    let cancel = cancel.clone();
                    async move { retry.run("has_chunk", &cancel, || repo.has_chunk(hash)).await }
                }
            })
            .await?;
        let missing: Vec<ChunkHash> = probes
            .into_iter()
            .filter(|(_, present)| !present)
            .map(|(hash, _)| hash)
            .collect();
        report.planned = missing.len();
        report.skipped = unique.len() - missing.len();
        info!(
            stream_id = %id,
            chunks = stream.chunks.len(),
            missing = report.planned,
            "planned push"
        );

        report.phase = SyncPhase::Transferring;
        let uploaded = self
            .for_each_chunk(missing, cancel, {
                let store = self.store.clone();
                let repo = self.repo.clone();
                let retry = self.retry;
                let cancel = cancel.clone();
                move |hash| {
                    let store = store.clone();
                    let repo = repo.clone();
                    let cancel = cancel.clone();
                    async move {
                        cancel.check()?;
                        let data = store.get_chunk(hash).await?;
                        check_digest(hash, &data)?;
                        let size = data.len() as u64;
                        retry
                            .run("put_chunk", &cancel, || repo.put_chunk(hash, data.clone()))
                            .await?;
                        debug!(%hash, size, "uploaded chunk");
                        Ok(size)
                    }
                }
            })
            .await?;
        report.transferred = uploaded.len();
        report.bytes_transferred = uploaded.iter().map(|(_, size)| size).sum();

        report.phase = SyncPhase::Verifying;
        let confirmed = report.skipped + report.transferred;
        if confirmed != unique.len() {
            return Err(SyncError::Worker(format!(
                "confirmed {confirmed} of {} chunks before commit",
                unique.len()
            )));
        }

        report.phase = SyncPhase::Committing;
        cancel.check()?;
        self.retry
            .run("put_stream", cancel, || self.repo.put_stream(&stream))
            .await?;
        Ok(())
    }

    /// Import a file and push the resulting stream.
    pub async fn push_file(&self, path: &Path, root: Option<&Path>, cancel: &CancelToken) -> SyncResult {
        if let Err(error) = cancel.check() {
            return Err(self.fail(push_report(path, None), error));
        }
        let stream = match self.import_file(path, root).await {
            Ok(stream) => stream,
            Err(error) => return Err(self.fail(push_report(path, None), error)),
        };
        match self.push_stream(stream.id, cancel).await {
            Ok(mut report) => {
                report.path = Some(path.to_path_buf());
                Ok(report)
            }
            Err(mut failure) => {
                failure.report.path = Some(path.to_path_buf());
                Err(failure)
            }
        }
    }

    /// Push a file, or every regular file under a directory (sorted, one
    /// stream each, paths recorded relative to the directory).
    ///
    /// A failing file does not stop the others; each gets its own result.
    pub async fn push_path(&self, path: &Path, cancel: &CancelToken) -> Result<Vec<SyncResult>, SyncError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|source| SyncError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if metadata.is_file() {
            return Ok(vec![self.push_file(path, None, cancel).await]);
        }
        if !metadata.is_dir() {
            return Err(SyncError::UnsupportedPath(path.to_path_buf()));
        }

        let files = regular_files(path).await?;
        info!(root = %path.display(), files = files.len(), "pushing directory");
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            results.push(self.push_file(&file, Some(path), cancel).await);
        }
        Ok(results)
    }

    // ----- Pull -----

    /// Fetch a stream from the repository into the local store.
    ///
    /// Leases every chunk before transferring, fetches the ones missing
    /// locally, verifies each by digest and length, then commits the
    /// manifest locally.
    pub async fn pull(&self, id: StreamId, cancel: &CancelToken) -> SyncResult {
        let mut report = SyncReport::new(Direction::Pull, Some(id));
        match self.run_pull(id, cancel, &mut report).await {
            Ok(()) => Ok(self.finish(report)),
            Err(error) => Err(self.fail(report, error)),
        }
    }

    async fn run_pull(
        &self,
        id: StreamId,
        cancel: &CancelToken,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        report.phase = SyncPhase::Planning;
        let stream = self
            .retry
            .run("fetch_stream", cancel, || self.repo.fetch_stream(id))
            .await?;
        verify_stream(&stream)?;
        if stream.id != id {
            return Err(drift_cas::CasError::StreamIdMismatch {
                claimed: id,
                actual: stream.id,
            }
            .into());
        }

        let unique = stream.unique_chunks();
        let _lease = self.store.lease(unique.iter().copied()).await;

        let mut missing = Vec::new();
        for hash in &unique {
            if !self.store.has_chunk(*hash).await? {
                missing.push(*hash);
            }
        }
        report.planned = missing.len();
        report.skipped = unique.len() - missing.len();
        info!(
            stream_id = %id,
            chunks = stream.chunks.len(),
            missing = report.planned,
            "planned pull"
        );

        let expected_len = expected_lengths(&stream);

        report.phase = SyncPhase::Transferring;
        let fetched = self
            .for_each_chunk(missing, cancel, {
                let store = self.store.clone();
                let repo = self.repo.clone();
                let retry = self.retry;
                let cancel = cancel.clone();
                let expected_len = Arc::new(expected_len);
                move |hash| {
                    let store = store.clone();
                    let repo = repo.clone();
                    let cancel = cancel.clone();
                    let expected_len = expected_len.clone();
                    async move {
                        cancel.check()?;
                        let data = retry
                            .run("fetch_chunk", &cancel, || repo.fetch_chunk(hash))
                            .await?;
                        check_digest(hash, &data)?;
                        let expected = expected_len.get(&hash).copied().unwrap_or_default();
                        if data.len() as u64 != expected {
                            return Err(SyncError::LengthMismatch {
                                hash,
                                expected,
                                actual: data.len() as u64,
                            });
                        }
                        let size = data.len() as u64;
                        store.put_chunk(hash, data).await?;
                        debug!(%hash, size, "fetched chunk");
                        Ok(size)
                    }
                }
            })
            .await?;
        report.transferred = fetched.len();
        report.bytes_transferred = fetched.iter().map(|(_, size)| size).sum();

        report.phase = SyncPhase::Verifying;
        for hash in &unique {
            if !self.store.has_chunk(*hash).await? {
                return Err(SyncError::Worker(format!(
                    "chunk {hash} missing locally after transfer"
                )));
            }
        }

        report.phase = SyncPhase::Committing;
        cancel.check()?;
        self.store.put_stream(&stream).await?;
        Ok(())
    }

    /// Pull a stream and reassemble it at `dest`.
    pub async fn pull_to(&self, id: StreamId, dest: &Path, cancel: &CancelToken) -> SyncResult {
        let mut report = self.pull(id, cancel).await.map_err(|mut failure| {
            failure.report.path = Some(dest.to_path_buf());
            failure
        })?;
        report.path = Some(dest.to_path_buf());

        if let Err(error) = self.store.materialize(&id, dest).await {
            return Err(self.fail(report, error.into()));
        }
        Ok(report)
    }

    // ----- Trees -----

    /// Push a directory as a tree: every file as its own stream, then the
    /// tree manifest listing them with the directories and symlinks.
    ///
    /// A failing file does not stop the others, but the tree is only
    /// published once every file's stream is committed remotely.
    pub async fn push_tree(&self, root: &Path, cancel: &CancelToken) -> Result<TreeReport, SyncError> {
        let metadata = tokio::fs::metadata(root).await.map_err(|source| SyncError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(SyncError::UnsupportedPath(root.to_path_buf()));
        }

        let nodes = scan_tree(root).await?;
        info!(root = %root.display(), entries = nodes.len(), "pushing tree");
        let mut report = TreeReport::new(Direction::Push, root.to_path_buf());
        let mut entries = Vec::with_capacity(nodes.len());

        for node in nodes {
            let Some(path) = relative_name(&node.path, Some(root)) else {
                continue;
            };
            let kind = match node.kind {
                NodeKind::Dir => {
                    report.dirs += 1;
                    EntryKind::Dir
                }
                NodeKind::Symlink(target) => {
                    report.symlinks += 1;
                    EntryKind::Symlink(target)
                }
                NodeKind::File => {
                    let result = self.push_file(&node.path, Some(root), cancel).await;
                    let stream_id = result.as_ref().ok().and_then(|r| r.stream_id);
                    report.files.push(result);
                    match stream_id {
                        Some(id) => EntryKind::File(id),
                        None => continue,
                    }
                }
            };
            entries.push(TreeEntry {
                path,
                mode: node.mode,
                kind,
            });
        }

        let failed = report.failures().count();
        if failed > 0 {
            warn!(root = %root.display(), failed, "files failed, tree not published");
            return Ok(report);
        }

        let tree = build_tree(mode_bits(&metadata), entries)?;
        cancel.check()?;
        self.retry
            .run("put_tree", cancel, || self.repo.put_tree(&tree))
            .await?;
        report.tree_id = Some(tree.id);
        report.complete = true;
        info!(
            tree_id = %tree.id,
            files = report.files.len(),
            dirs = report.dirs,
            symlinks = report.symlinks,
            "published tree"
        );
        Ok(report)
    }

    /// Fetch a tree and recreate it under `dest`: directories, every file
    /// pulled and materialized, then symlinks, then directory modes.
    ///
    /// Entries left over from an earlier deploy are replaced. When a file
    /// fails, the rest are still pulled but symlinks and directory modes
    /// are not applied and the report is incomplete.
    pub async fn pull_tree(&self, id: TreeId, dest: &Path, cancel: &CancelToken) -> Result<TreeReport, SyncError> {
        let tree = self
            .retry
            .run("fetch_tree", cancel, || self.repo.fetch_tree(id))
            .await?;
        verify_tree(&tree)?;
        if tree.id != id {
            return Err(drift_cas::CasError::TreeIdMismatch {
                claimed: id,
                actual: tree.id,
            }
            .into());
        }

        let mut report = TreeReport::new(Direction::Pull, dest.to_path_buf());
        report.tree_id = Some(id);
        create_dir(dest).await?;

        for entry in &tree.entries {
            cancel.check()?;
            let target = dest.join(&entry.path);
            match &entry.kind {
                EntryKind::Dir => {
                    clear_non_dir(&target).await?;
                    create_dir(&target).await?;
                    report.dirs += 1;
                }
                EntryKind::File(stream_id) => {
                    report.files.push(self.pull_to(*stream_id, &target, cancel).await);
                }
                EntryKind::Symlink(_) => {}
            }
        }

        let failed = report.failures().count();
        if failed > 0 {
            warn!(tree_id = %id, failed, "files failed, tree deploy incomplete");
            return Ok(report);
        }

        for entry in &tree.entries {
            if let EntryKind::Symlink(link_target) = &entry.kind {
                let path = dest.join(&entry.path);
                replace_with_symlink(link_target, &path).await?;
                report.symlinks += 1;
            }
        }
        apply_dir_modes(&tree, dest).await?;

        report.complete = true;
        info!(
            tree_id = %id,
            dest = %dest.display(),
            files = report.files.len(),
            dirs = report.dirs,
            symlinks = report.symlinks,
            "deployed tree"
        );
        Ok(report)
    }

    // ----- Status -----

    /// Compare a file against the local store and the repository.
    ///
    /// Reads the file and queries the repository; writes nothing.
    pub async fn status(&self, path: &Path, root: Option<&Path>) -> Result<StatusReport, SyncError> {
        let cancel = CancelToken::new();
        let stream = self.scan_file(path, root).await?;
        let local_committed = self.store.has_stream(&stream.id)?;

        let mut missing_remote = Vec::new();
        for hash in stream.unique_chunks() {
            let present = self
                .retry
                .run("has_chunk", &cancel, || self.repo.has_chunk(hash))
                .await?;
            if !present {
                missing_remote.push(hash);
            }
        }
        let remote_committed = self
            .retry
            .run("has_stream", &cancel, || self.repo.has_stream(stream.id))
            .await?;

        Ok(StatusReport {
            path: path.to_path_buf(),
            stream_id: stream.id,
            chunks: stream.chunks.len(),
            missing_remote,
            local_committed,
            remote_committed,
        })
    }

    /// [`status`](Self::status) for a file or every regular file under a directory.
    pub async fn status_path(&self, path: &Path) -> Result<Vec<StatusReport>, SyncError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|source| SyncError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if metadata.is_file() {
            return Ok(vec![self.status(path, None).await?]);
        }
        if !metadata.is_dir() {
            return Err(SyncError::UnsupportedPath(path.to_path_buf()));
        }
        let mut reports = Vec::new();
        for file in regular_files(path).await? {
            reports.push(self.status(&file, Some(path)).await?);
        }
        Ok(reports)
    }

    // ----- Worker pool -----

    /// Run `work` for every hash with at most `concurrency` in flight.
    ///
    /// The first error aborts the remaining workers and is returned.
    /// Results come back in completion order.
    async fn for_each_chunk<T, F, Fut>(
        &self,
        hashes: Vec<ChunkHash>,
        cancel: &CancelToken,
        work: F,
    ) -> Result<Vec<(ChunkHash, T)>, SyncError>
    where
        F: Fn(ChunkHash) -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut pending = hashes.into_iter();
        let mut results = Vec::with_capacity(pending.len());

        while !workers.is_empty() || !pending.as_slice().is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    workers.abort_all();
                    return Err(SyncError::Cancelled);
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((hash, Ok(value))) => results.push((hash, value)),
                        Ok((hash, Err(e))) => {
                            warn!(%hash, error = %e, "chunk transfer failed, aborting run");
                            workers.abort_all();
                            return Err(e);
                        }
                        Err(e) => {
                            workers.abort_all();
                            return Err(SyncError::Worker(e.to_string()));
                        }
                    }
                }
                permit = semaphore.clone().acquire_owned(), if !pending.as_slice().is_empty() => {
                    let permit = permit.map_err(|e| SyncError::Worker(e.to_string()))?;
                    if let Some(hash) = pending.next() {
                        let fut = work(hash);
                        workers.spawn(async move {
                            let _permit = permit;
                            (hash, fut.await)
                        });
                    }
                }
            }
        }

        Ok(results)
    }

    fn finish(&self, mut report: SyncReport) -> SyncReport {
        report.phase = SyncPhase::Done;
        info!(
            direction = %report.direction,
            stream_id = ?report.stream_id,
            transferred = report.transferred,
            skipped = report.skipped,
            bytes = report.bytes_transferred,
            "sync complete"
        );
        report
    }

    fn fail(&self, mut report: SyncReport, error: SyncError) -> SyncFailure {
        let kind = error.kind();
        warn!(
            direction = %report.direction,
            stream_id = ?report.stream_id,
            phase = %report.phase,
            error = %error,
            "sync failed"
        );
        report.phase = SyncPhase::Failed(kind);
        SyncFailure {
            report: Box::new(report),
            error,
        }
    }
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn create_dir(path: &Path) -> Result<(), SyncError> {
    tokio::fs::create_dir_all(path).await.map_err(io_at(path))
}

/// Remove a file or symlink sitting where a directory must go.
async fn clear_non_dir(path: &Path) -> Result<(), SyncError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if !meta.is_dir() => tokio::fs::remove_file(path).await.map_err(io_at(path)),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_at(path)(e)),
    }
}

#[cfg(unix)]
async fn replace_with_symlink(target: &str, path: &Path) -> Result<(), SyncError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            return Err(SyncError::UnsupportedPath(path.to_path_buf()));
        }
        Ok(_) => tokio::fs::remove_file(path).await.map_err(io_at(path))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_at(path)(e)),
    }
    tokio::fs::symlink(target, path).await.map_err(io_at(path))
}

#[cfg(not(unix))]
async fn replace_with_symlink(target: &str, path: &Path) -> Result<(), SyncError> {
    warn!(path = %path.display(), %target, "symlinks unsupported on this platform, skipping");
    Ok(())
}

/// Set recorded directory modes, deepest first, root last.
#[cfg(unix)]
async fn apply_dir_modes(tree: &Tree, dest: &Path) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;

    let dirs = tree
        .entries
        .iter()
        .filter(|e| e.kind == EntryKind::Dir)
        .map(|e| (dest.join(&e.path), e.mode))
        .rev()
        .chain(std::iter::once((dest.to_path_buf(), tree.root_mode)));
    for (path, mode) in dirs {
        if mode == 0 {
            continue;
        }
        let perms = std::fs::Permissions::from_mode(mode & 0o7777);
        tokio::fs::set_permissions(&path, perms)
            .await
            .map_err(io_at(&path))?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn apply_dir_modes(_tree: &Tree, _dest: &Path) -> Result<(), SyncError> {
    Ok(())
}

fn push_report(path: &Path, id: Option<StreamId>) -> SyncReport {
    let mut report = SyncReport::new(Direction::Push, id);
    report.path = Some(path.to_path_buf());
    report
}

fn check_digest(expected: ChunkHash, data: &Bytes) -> Result<(), SyncError> {
    let actual = ChunkHash::from_data(data);
    if actual != expected {
        return Err(SyncError::HashMismatch { expected, actual });
    }
    Ok(())
}

/// Length each distinct chunk must have, from its position in the stream.
fn expected_lengths(stream: &Stream) -> HashMap<ChunkHash, u64> {
    stream
        .chunks
        .iter()
        .enumerate()
        .filter_map(|(i, hash)| stream.chunk_len(i).map(|len| (*hash, len)))
        .collect()
}

/// Open a file for chunking and capture its metadata.
async fn open_source(path: &Path, root: Option<&Path>) -> Result<(tokio::fs::File, FileMeta), SyncError> {
    let io_err = |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let metadata = file.metadata().await.map_err(io_err)?;
    if !metadata.is_file() {
        return Err(SyncError::UnsupportedPath(path.to_path_buf()));
    }

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let meta = FileMeta {
        size: metadata.len(),
        mode: mode_bits(&metadata),
        mtime,
        path: relative_name(path, root),
    };
    Ok((file, meta))
}
