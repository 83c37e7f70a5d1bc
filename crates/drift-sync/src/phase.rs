//! Run state and reports.

use std::fmt;
use std::path::PathBuf;

use drift_types::{ChunkHash, StreamId, TreeId};

use crate::error::SyncFailure;

/// Why a run ended in [`SyncPhase::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A manifest or chunk was definitively absent.
    NotFound,
    /// Data failed digest or length verification.
    HashMismatch,
    /// A commit referenced chunks that were not present.
    IncompleteStream,
    /// A stream ID was bound to different content.
    ImmutableConflict,
    /// Transient failures outlasted the retry budget.
    RetriesExhausted,
    /// The run was cancelled.
    Cancelled,
    /// The repository refused a request.
    Remote,
    /// Local I/O or store failure.
    Local,
    /// Malformed input.
    Invalid,
}

/// Where a run is in `Planning → Transferring → Verifying → Committing → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Resolving the target stream and diffing it against the destination.
    Planning,
    /// Moving missing chunks.
    Transferring,
    /// Confirming every chunk is present at the destination.
    Verifying,
    /// Publishing the manifest.
    Committing,
    /// Finished; the manifest is committed.
    Done,
    /// Stopped without committing.
    Failed(FailureKind),
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Transferring => write!(f, "transferring"),
            Self::Verifying => write!(f, "verifying"),
            Self::Committing => write!(f, "committing"),
            Self::Done => write!(f, "done"),
            Self::Failed(kind) => write!(f, "failed({kind:?})"),
        }
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local store → repository.
    Push,
    /// Repository → local store.
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
        }
    }
}

/// Outcome of one push or pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// The stream synchronized, once known.
    pub stream_id: Option<StreamId>,
    /// Local file the stream came from or was written to.
    pub path: Option<PathBuf>,
    /// Push or pull.
    pub direction: Direction,
    /// Distinct chunks that needed transferring.
    pub planned: usize,
    /// Chunks actually transferred.
    pub transferred: usize,
    /// Distinct chunks already present at the destination.
    pub skipped: usize,
    /// Payload bytes moved.
    pub bytes_transferred: u64,
    /// Final (or current) phase.
    pub phase: SyncPhase,
}

impl SyncReport {
    pub(crate) fn new(direction: Direction, stream_id: Option<StreamId>) -> Self {
        Self {
            stream_id,
            path: None,
            direction,
            planned: 0,
            transferred: 0,
            skipped: 0,
            bytes_transferred: 0,
            phase: SyncPhase::Planning,
        }
    }
}

/// Outcome of a whole-directory push or deploy.
#[derive(Debug)]
pub struct TreeReport {
    /// Push or pull.
    pub direction: Direction,
    /// Directory pushed from or deployed into.
    pub root: PathBuf,
    /// The tree, once built (push) or fetched (pull).
    pub tree_id: Option<TreeId>,
    /// One result per file, in path order.
    pub files: Vec<Result<SyncReport, SyncFailure>>,
    /// Directories recorded or created.
    pub dirs: usize,
    /// Symlinks recorded or created.
    pub symlinks: usize,
    /// Push: the tree manifest was published. Pull: every entry was
    /// written and directory modes applied.
    pub complete: bool,
}

impl TreeReport {
    pub(crate) fn new(direction: Direction, root: PathBuf) -> Self {
        Self {
            direction,
            root,
            tree_id: None,
            files: Vec::new(),
            dirs: 0,
            symlinks: 0,
            complete: false,
        }
    }

    /// Files that failed.
    pub fn failures(&self) -> impl Iterator<Item = &SyncFailure> {
        self.files.iter().filter_map(|r| r.as_ref().err())
    }
}

/// Read-only comparison of a local file against the store and repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// The file inspected.
    pub path: PathBuf,
    /// Stream ID the file's current content maps to.
    pub stream_id: StreamId,
    /// Chunks in the stream, counting repeats.
    pub chunks: usize,
    /// Distinct chunks the repository does not hold.
    pub missing_remote: Vec<ChunkHash>,
    /// Whether the local store has this stream committed.
    pub local_committed: bool,
    /// Whether the repository has this stream committed.
    pub remote_committed: bool,
}

impl StatusReport {
    /// Nothing left to push.
    pub fn in_sync(&self) -> bool {
        self.remote_committed && self.missing_remote.is_empty()
    }
}
