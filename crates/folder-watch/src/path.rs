use std::path::{Component, Path, PathBuf};

use crate::types::FolderWatchError;

const STATE_DIR_NAME: &str = ".folder-mcp";

/// Resolve and validate the watched root before any watcher is created.
pub(crate) fn canonicalize_folder_root(folder_root: &Path) -> Result<PathBuf, FolderWatchError> {
    if !folder_root.exists() {
        return Err(FolderWatchError::FolderRootNotFound(
            folder_root.display().to_string(),
        ));
    }

    if !folder_root.is_dir() {
        return Err(FolderWatchError::FolderRootNotDirectory(
            folder_root.display().to_string(),
        ));
    }

    std::fs::canonicalize(folder_root).map_err(|source| FolderWatchError::CanonicalizeFolderRoot {
        path: folder_root.display().to_string(),
        source,
    })
}

/// Resolve an event path to a normalized folder-relative path. Paths outside
/// the folder, traversals, and anything under the `.folder-mcp` state
/// directory resolve to `None`; the daemon's own writes must never loop back
/// into the watcher.
pub(crate) fn to_folder_rel_path(folder_root: &Path, event_path: &Path) -> Option<String> {
    let candidate = if event_path.is_absolute() {
        event_path.to_path_buf()
    } else {
        folder_root.join(event_path)
    };

    let rel = candidate.strip_prefix(folder_root).ok()?;
    let normalized = normalize_rel_path(rel)?;

    if normalized == STATE_DIR_NAME || normalized.starts_with(&format!("{STATE_DIR_NAME}/")) {
        return None;
    }

    Some(normalized)
}

fn normalize_rel_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if parts.is_empty() {
        return None;
    }

    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::to_folder_rel_path;
    use std::path::Path;

    #[test]
    fn converts_absolute_path_inside_folder() {
        let root = Path::new("/folder");
        let path = Path::new("/folder/a/b.md");
        assert_eq!(to_folder_rel_path(root, path).as_deref(), Some("a/b.md"));
    }

    #[test]
    fn rejects_absolute_path_outside_folder() {
        let root = Path::new("/folder");
        let path = Path::new("/other/a.md");
        assert_eq!(to_folder_rel_path(root, path), None);
    }

    #[test]
    fn rejects_parent_traversal() {
        let root = Path::new("/folder");
        let path = Path::new("../outside.md");
        assert_eq!(to_folder_rel_path(root, path), None);
    }

    #[test]
    fn rejects_state_directory_writes() {
        let root = Path::new("/folder");
        let path = Path::new("/folder/.folder-mcp/embeddings.db");
        assert_eq!(to_folder_rel_path(root, path), None);
    }
}
