//! Crash-safe whole-file writes.

use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

/// Write `data` to `path` through a uniquely named temp file in the same
/// directory, then rename it into place.
///
/// Concurrent writers of the same path each get their own temp file. When
/// the rename fails but `path` already exists, another writer won and the
/// call succeeds: every caller writes content-addressed bytes, so the
/// winner's file is equivalent.
pub async fn write_atomic(path: PathBuf, data: Bytes) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &data))
        .await
        .map_err(std::io::Error::other)?
}

fn write_atomic_blocking(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".drift-")
        .suffix(".tmp")
        .tempfile_in(parent_dir(path))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    match tmp.persist(path) {
        Ok(_) => Ok(()),
        Err(e) if path.exists() => {
            debug!(path = %path.display(), error = %e.error, "lost rename race, keeping existing file");
            Ok(())
        }
        Err(e) => Err(e.error),
    }
}

/// The directory a temp file for `path` must live in so a rename stays on
/// one filesystem.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
