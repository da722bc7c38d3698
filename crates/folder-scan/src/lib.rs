//! Folder enumeration and change detection.
//!
//! The scanner walks a registered folder, keeps files whose extension is on
//! the indexable allowlist, fingerprints their content with blake3, and diffs
//! the result against the file states persisted by the vector store. The diff
//! is the sole input to lifecycle task production: `added`, `modified`, and
//! `removed` map one-to-one onto embedding tasks.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs::File,
    io,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

const STATE_DIR_NAME: &str = ".folder-mcp";

/// Extensions eligible for indexing. Parsers for the office formats are
/// collaborator plug-ins; the scanner only decides what is worth visiting.
pub const INDEXABLE_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "csv",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeInfo {
    pub path: String,
    pub kind: ChangeKind,
    pub size: u64,
    pub mtime_ns: i64,
    /// Present for added/modified entries; removed files have no content left
    /// to fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// A candidate file found during the walk, before any diffing.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub size: u64,
    pub mtime_ns: i64,
}

/// The scan state the store remembered for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownFileState {
    pub fingerprint: String,
    pub mtime_ns: i64,
    pub file_size: i64,
}

/// Enumerate indexable files under `root`. Hidden entries and the
/// `.folder-mcp` state directory are never descended into.
pub fn collect_indexable_files(root: &Path) -> Result<Vec<ScannedFile>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| should_descend(entry, root));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to traverse {}", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }

        if !has_indexable_extension(entry.path()) {
            continue;
        }

        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;

        let rel_path = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("Failed to relativize {}", entry.path().display()))?;

        files.push(ScannedFile {
            abs_path: entry.path().to_path_buf(),
            rel_path: normalize_rel_path(rel_path),
            size: metadata.len(),
            mtime_ns: metadata
                .modified()
                .ok()
                .and_then(system_time_to_nanos)
                .unwrap_or(0),
        });
    }

    files.sort_by(|left, right| left.rel_path.cmp(&right.rel_path));
    Ok(files)
}

/// Diff the folder contents against the persisted file states.
///
/// Files whose size and mtime both match the stored state are skipped without
/// re-hashing; anything else is fingerprinted and compared by content, so an
/// mtime-only touch produces no change entry.
pub fn detect_changes(
    root: &Path,
    known: &HashMap<String, KnownFileState>,
) -> Result<Vec<FileChangeInfo>> {
    let discovered = collect_indexable_files(root)?;
    let mut changes = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for file in discovered {
        seen.insert(file.rel_path.clone());

        match known.get(&file.rel_path) {
            None => {
                let fingerprint = fingerprint_file(&file.abs_path)?;
                changes.push(FileChangeInfo {
                    path: file.rel_path,
                    kind: ChangeKind::Added,
                    size: file.size,
                    mtime_ns: file.mtime_ns,
                    fingerprint: Some(fingerprint),
                });
            }
            Some(state) => {
                if state.file_size == file.size as i64 && state.mtime_ns == file.mtime_ns {
                    continue;
                }

                let fingerprint = fingerprint_file(&file.abs_path)?;
                if fingerprint == state.fingerprint {
                    continue;
                }

                changes.push(FileChangeInfo {
                    path: file.rel_path,
                    kind: ChangeKind::Modified,
                    size: file.size,
                    mtime_ns: file.mtime_ns,
                    fingerprint: Some(fingerprint),
                });
            }
        }
    }

    for (rel_path, state) in known {
        if seen.contains(rel_path) {
            continue;
        }

        changes.push(FileChangeInfo {
            path: rel_path.clone(),
            kind: ChangeKind::Removed,
            size: state.file_size.max(0) as u64,
            mtime_ns: state.mtime_ns,
            fingerprint: None,
        });
    }

    changes.sort_by(|left, right| left.path.cmp(&right.path));
    Ok(changes)
}

/// 256-bit blake3 content fingerprint, hex encoded.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn should_descend(entry: &DirEntry, root: &Path) -> bool {
    if entry.path() == root {
        return true;
    }

    if is_hidden(entry) {
        return false;
    }

    !is_inside_state_dir(entry.path(), root)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn is_inside_state_dir(path: &Path, root: &Path) -> bool {
    if let Ok(rel) = path.strip_prefix(root) {
        if let Some(Component::Normal(component)) = rel.components().next() {
            return component == OsStr::new(STATE_DIR_NAME);
        }
    }
    false
}

fn has_indexable_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| {
            INDEXABLE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

pub fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn system_time_to_nanos(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| i64::try_from(duration.as_nanos()).ok())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        fs,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::{
        collect_indexable_files, detect_changes, fingerprint_file, ChangeKind, KnownFileState,
    };

    struct ScanHarness {
        root: PathBuf,
    }

    impl ScanHarness {
        fn new(prefix: &str) -> Self {
            let mut root = std::env::temp_dir();
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_nanos())
                .unwrap_or_default();
            root.push(format!("{prefix}-{nanos}"));
            fs::create_dir_all(&root).expect("temp folder should be created");
            Self { root }
        }

        fn write(&self, rel: &str, contents: &str) -> PathBuf {
            let path = self.root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("parent dirs should be created");
            }
            fs::write(&path, contents).expect("file should be written");
            path
        }

        fn state_for(&self, rel: &str) -> KnownFileState {
            let path = self.root.join(rel);
            let metadata = fs::metadata(&path).expect("file should stat");
            KnownFileState {
                fingerprint: fingerprint_file(&path).expect("file should hash"),
                mtime_ns: metadata
                    .modified()
                    .ok()
                    .and_then(|time| {
                        time.duration_since(UNIX_EPOCH)
                            .ok()
                            .and_then(|duration| i64::try_from(duration.as_nanos()).ok())
                    })
                    .unwrap_or(0),
                file_size: metadata.len() as i64,
            }
        }
    }

    impl Drop for ScanHarness {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn empty_folder_yields_empty_diff() {
        let harness = ScanHarness::new("scan-empty");
        let changes =
            detect_changes(&harness.root, &HashMap::new()).expect("scan should succeed");
        assert!(changes.is_empty());
    }

    #[test]
    fn new_file_is_reported_as_added_with_fingerprint() {
        let harness = ScanHarness::new("scan-added");
        harness.write("docs/a.txt", "remote work policy");

        let changes =
            detect_changes(&harness.root, &HashMap::new()).expect("scan should succeed");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert_eq!(changes[0].path, "docs/a.txt");
        assert!(changes[0].fingerprint.is_some());
    }

    #[test]
    fn scan_is_idempotent_when_nothing_changed() {
        let harness = ScanHarness::new("scan-idempotent");
        harness.write("a.txt", "stable content");

        let mut known = HashMap::new();
        known.insert("a.txt".to_string(), harness.state_for("a.txt"));

        let changes = detect_changes(&harness.root, &known).expect("scan should succeed");
        assert!(changes.is_empty(), "unchanged files must not produce a diff");
    }

    #[test]
    fn content_change_is_reported_as_modified() {
        let harness = ScanHarness::new("scan-modified");
        harness.write("a.txt", "before");

        let mut known = HashMap::new();
        known.insert("a.txt".to_string(), harness.state_for("a.txt"));

        std::thread::sleep(std::time::Duration::from_millis(5));
        harness.write("a.txt", "after edit");

        let changes = detect_changes(&harness.root, &known).expect("scan should succeed");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn deleted_file_is_reported_as_removed() {
        let harness = ScanHarness::new("scan-removed");
        let path = harness.write("a.txt", "doomed");

        let mut known = HashMap::new();
        known.insert("a.txt".to_string(), harness.state_for("a.txt"));
        fs::remove_file(path).expect("file should be removed");

        let changes = detect_changes(&harness.root, &known).expect("scan should succeed");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert!(changes[0].fingerprint.is_none());
    }

    #[test]
    fn hidden_files_state_dir_and_foreign_extensions_are_excluded() {
        let harness = ScanHarness::new("scan-excluded");
        harness.write(".hidden/secret.txt", "no");
        harness.write(".folder-mcp/embeddings.db", "no");
        harness.write("binary.exe", "no");
        harness.write("notes.md", "yes");
        harness.write("report.PDF", "yes, case-insensitive");

        let files = collect_indexable_files(&harness.root).expect("walk should succeed");
        let paths: Vec<&str> = files.iter().map(|file| file.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["notes.md", "report.PDF"]);
    }
}
