//! Directory traversal for tree pushes.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::SyncError;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What [`scan_tree`] found at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File,
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    pub path: PathBuf,
    pub mode: u32,
    pub kind: NodeKind,
}

/// Every file, directory and symlink under `root` (not `root` itself),
/// sorted by path. Symlinks are recorded, never followed. Special files
/// and links with non-UTF-8 targets are skipped with a warning.
pub(crate) async fn scan_tree(root: &Path) -> Result<Vec<Node>, SyncError> {
    let mut nodes = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let path = entry.path();
            let metadata = entry.metadata().await.map_err(io_err(&path))?;
            let file_type = metadata.file_type();
            let kind = if file_type.is_dir() {
                dirs.push(path.clone());
                NodeKind::Dir
            } else if file_type.is_file() {
                NodeKind::File
            } else if file_type.is_symlink() {
                let target = tokio::fs::read_link(&path).await.map_err(io_err(&path))?;
                match target.into_os_string().into_string() {
                    Ok(target) => NodeKind::Symlink(target),
                    Err(_) => {
                        warn!(path = %path.display(), "skipping symlink with non-UTF-8 target");
                        continue;
                    }
                }
            } else {
                warn!(path = %path.display(), "skipping special file");
                continue;
            };
            nodes.push(Node {
                mode: mode_bits(&metadata),
                path,
                kind,
            });
        }
    }

    nodes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(nodes)
}

/// Every regular file under `root`, sorted by path.
///
/// Symlinks and special files are skipped with a warning.
pub(crate) async fn regular_files(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let files = scan_tree(root)
        .await?
        .into_iter()
        .filter_map(|node| match node.kind {
            NodeKind::File => Some(node.path),
            NodeKind::Symlink(_) => {
                warn!(path = %node.path.display(), "skipping symlink");
                None
            }
            NodeKind::Dir => None,
        })
        .collect();
    Ok(files)
}

#[cfg(unix)]
pub(crate) fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o444 } else { 0o644 }
}

/// `path` relative to `root`, with `/` separators.
pub(crate) fn relative_name(path: &Path, root: Option<&Path>) -> Option<String> {
    let rel = match root {
        Some(root) => path.strip_prefix(root).ok()?,
        None => Path::new(path.file_name()?),
    };
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
