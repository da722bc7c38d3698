use std::{
    fs::OpenOptions,
    io::Write,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const ERROR_LOG_FILE: &str = "errors.log";

/// One JSON-Lines record in `<folder>/.folder-mcp/errors.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub ts: u64,
    pub op: String,
    pub error: String,
    pub retry: u32,
}

impl ErrorLogEntry {
    pub fn new(op: &str, error: &str, retry: u32) -> Self {
        Self {
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_secs())
                .unwrap_or(0),
            op: op.to_string(),
            error: error.to_string(),
            retry,
        }
    }
}

/// Append an entry to the folder's error log. Indexing never fails because
/// logging did; callers get the error back only to trace it.
pub fn append_error_entry(folder_root: &Path, entry: &ErrorLogEntry) -> Result<()> {
    let state_dir = folder_root.join(vector_store::STATE_DIR_NAME);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;

    let path = state_dir.join(ERROR_LOG_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open error log {}", path.display()))?;

    let line = serde_json::to_string(entry).context("Failed to serialize error log entry")?;
    writeln!(file, "{line}").with_context(|| format!("Failed to append to {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::{append_error_entry, ErrorLogEntry};

    fn temp_folder() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!("indexing-errorlog-{nanos}"));
        fs::create_dir_all(&dir).expect("temp dir should be created");
        dir
    }

    #[test]
    fn entries_append_as_json_lines() {
        let folder = temp_folder();

        append_error_entry(&folder, &ErrorLogEntry::new("parse", "bad file", 0))
            .expect("first append should succeed");
        append_error_entry(&folder, &ErrorLogEntry::new("embed", "daemon down", 2))
            .expect("second append should succeed");

        let raw = fs::read_to_string(folder.join(".folder-mcp/errors.log"))
            .expect("error log should exist");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: ErrorLogEntry = serde_json::from_str(lines[0]).expect("line should parse");
        assert_eq!(first.op, "parse");
        assert_eq!(first.retry, 0);

        let second: ErrorLogEntry = serde_json::from_str(lines[1]).expect("line should parse");
        assert_eq!(second.error, "daemon down");
        assert_eq!(second.retry, 2);

        let _ = fs::remove_dir_all(&folder);
    }
}
