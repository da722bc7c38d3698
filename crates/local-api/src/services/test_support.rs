use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use embedder::{test_util::DeterministicEmbedder, Embedder};
use fmdm::Fmdm;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use vector_store::{DocumentMeta, NewChunk, VectorStore};

use crate::{ApiState, FolderHandle, RefreshRequest};

const TEST_DIMENSION: usize = 32;

/// Shared harness for service tests: an [`ApiState`] wired to a deterministic
/// embedder, plus helpers to seed folders with pre-embedded documents.
pub(crate) struct ApiHarness {
    pub state: Arc<ApiState>,
    root: PathBuf,
    refresh_rx: Mutex<UnboundedReceiver<RefreshRequest>>,
}

impl ApiHarness {
    pub fn new(prefix: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        let root = std::env::temp_dir().join(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).expect("temp root should be created");

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let state = ApiState::new(
            Fmdm::new(),
            Arc::new(Embedder::deterministic("test-model", TEST_DIMENSION)),
            refresh_tx,
        );

        Self {
            state,
            root,
            refresh_rx: Mutex::new(refresh_rx),
        }
    }

    /// Write `content` to disk under the folder and index it as one chunk,
    /// embedding with the same deterministic backend queries use.
    pub fn seed_document(&self, folder_key: &str, rel_path: &str, content: &str) {
        let handle = self.folder_handle(folder_key);

        let abs_path = handle.root.join(rel_path);
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).expect("parent dirs should be created");
        }
        fs::write(&abs_path, content).expect("document should be written");

        let vectors = DeterministicEmbedder::new(TEST_DIMENSION).embed(&[content.to_string()]);
        let parser_kind = if rel_path.ends_with(".md") {
            "markdown"
        } else {
            "text"
        };

        let mut store = handle.store.lock().expect("store mutex poisoned");
        store
            .upsert_document_chunks(
                &DocumentMeta {
                    file_path: rel_path.to_string(),
                    fingerprint: test_fingerprint(content),
                    file_size: content.len() as i64,
                    last_modified_ns: 1_000,
                    parser_kind: parser_kind.to_string(),
                },
                &[NewChunk {
                    start_pos: 0,
                    end_pos: content.len().max(1),
                    token_count: content.split_whitespace().count(),
                    content: content.to_string(),
                    structural: None,
                }],
                &vectors,
            )
            .expect("seed upsert should succeed");
    }

    pub fn try_recv_refresh(&self) -> Option<RefreshRequest> {
        self.refresh_rx
            .lock()
            .expect("refresh receiver mutex poisoned")
            .try_recv()
            .ok()
    }

    fn folder_handle(&self, folder_key: &str) -> FolderHandle {
        if let Ok(handle) = self.state.folder(folder_key) {
            return handle;
        }

        let sanitized: String = folder_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let folder_root = self.root.join(sanitized);
        fs::create_dir_all(&folder_root).expect("folder root should be created");

        let store = VectorStore::open(&folder_root, "test-model", TEST_DIMENSION)
            .expect("store should open");
        let handle = FolderHandle {
            folder_path: folder_key.to_string(),
            root: folder_root,
            store: Arc::new(Mutex::new(store)),
        };
        self.state.register_folder(handle.clone());
        handle
    }
}

impl Drop for ApiHarness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// Any stable per-content string works as a fingerprint for these tests.
fn test_fingerprint(content: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
