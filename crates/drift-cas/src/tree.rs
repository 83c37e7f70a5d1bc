//! Directory tree manifests.
//!
//! A [`Tree`] is hashed the same way as a stream: `blake3(postcard(content))`
//! over the root mode and the sorted entry list, version byte excluded.
//! Entry paths are validated so a tree fetched from a repository can only
//! write beneath the directory it is deployed into.

use std::collections::HashMap;

use drift_types::{EntryKind, MANIFEST_VERSION, Tree, TreeEntry, TreeId};
use serde::Serialize;

use crate::error::CasError;

#[derive(Serialize)]
struct TreeContent<'a> {
    root_mode: u32,
    entries: &'a [TreeEntry],
}

fn tree_id(root_mode: u32, entries: &[TreeEntry]) -> Result<TreeId, CasError> {
    let serialized = postcard::to_allocvec(&TreeContent { root_mode, entries })
        .map_err(|e| CasError::Serialization(e.to_string()))?;
    Ok(TreeId::from_data(&serialized))
}

/// Build a [`Tree`] from entries in any order.
pub fn build_tree(root_mode: u32, mut entries: Vec<TreeEntry>) -> Result<Tree, CasError> {
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    check_entries(&entries)?;
    let id = tree_id(root_mode, &entries)?;
    Ok(Tree {
        version: MANIFEST_VERSION,
        id,
        root_mode,
        entries,
    })
}

/// Check entry paths and that the ID matches the content.
pub fn verify_tree(tree: &Tree) -> Result<(), CasError> {
    check_entries(&tree.entries)?;
    let actual = tree_id(tree.root_mode, &tree.entries)?;
    if actual != tree.id {
        return Err(CasError::TreeIdMismatch {
            claimed: tree.id,
            actual,
        });
    }
    Ok(())
}

fn invalid(path: &str, reason: &'static str) -> CasError {
    CasError::InvalidEntry {
        path: path.to_string(),
        reason,
    }
}

/// Entries must be sorted and unique, with relative paths that never
/// climb out of the root. Every ancestor of an entry must itself be listed
/// as a directory, so deploying never passes through a file or symlink.
fn check_entries(entries: &[TreeEntry]) -> Result<(), CasError> {
    let mut kinds: HashMap<&str, &EntryKind> = HashMap::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let path = entry.path.as_str();
        if path.is_empty() || path.starts_with('/') || path.contains('\\') {
            return Err(invalid(path, "not a relative path"));
        }
        if path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(invalid(path, "empty, `.` or `..` component"));
        }
        if i > 0 && entries[i - 1].path.as_str() >= path {
            return Err(invalid(path, "entries not sorted or duplicated"));
        }
        if let EntryKind::Symlink(target) = &entry.kind
            && target.is_empty()
        {
            return Err(invalid(path, "empty symlink target"));
        }
        kinds.insert(path, &entry.kind);
    }

    for entry in entries {
        let path = entry.path.as_str();
        let ancestors = path.match_indices('/').map(|(at, _)| &path[..at]);
        for ancestor in ancestors {
            if !matches!(kinds.get(ancestor), Some(EntryKind::Dir)) {
                return Err(invalid(path, "parent is not a directory entry"));
            }
        }
    }
    Ok(())
}

/// Serialize a tree to postcard bytes.
pub fn serialize_tree(tree: &Tree) -> Result<Vec<u8>, CasError> {
    postcard::to_allocvec(tree).map_err(|e| CasError::Serialization(e.to_string()))
}

/// Deserialize and verify a tree from postcard bytes.
pub fn deserialize_tree(bytes: &[u8]) -> Result<Tree, CasError> {
    let tree: Tree =
        postcard::from_bytes(bytes).map_err(|e| CasError::Serialization(e.to_string()))?;
    if tree.version != MANIFEST_VERSION {
        return Err(CasError::UnsupportedVersion {
            found: tree.version,
            supported: MANIFEST_VERSION,
        });
    }
    verify_tree(&tree)?;
    Ok(tree)
}
