use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use embedder::Embedder;
use fmdm::Fmdm;
use tokio::sync::mpsc::UnboundedSender;
use vector_store::VectorStore;

use crate::{LocalApiError, ApiResult};

/// One registered folder as the API sees it: the canonical path plus a shared
/// handle on its store.
#[derive(Clone)]
pub struct FolderHandle {
    pub folder_path: String,
    pub root: PathBuf,
    pub store: Arc<Mutex<VectorStore>>,
}

/// Ask the daemon to re-scan one document.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub folder_path: String,
    pub file_path: String,
}

/// Shared read surface for both transports. Folder handles are registered by
/// the daemon as lifecycles come up and removed when folders are dropped.
pub struct ApiState {
    fmdm: Arc<Fmdm>,
    embedder: Arc<Embedder>,
    folders: Mutex<HashMap<String, FolderHandle>>,
    refresh_tx: UnboundedSender<RefreshRequest>,
}

impl ApiState {
    pub fn new(
        fmdm: Arc<Fmdm>,
        embedder: Arc<Embedder>,
        refresh_tx: UnboundedSender<RefreshRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fmdm,
            embedder,
            folders: Mutex::new(HashMap::new()),
            refresh_tx,
        })
    }

    pub fn fmdm(&self) -> &Arc<Fmdm> {
        &self.fmdm
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub fn register_folder(&self, handle: FolderHandle) {
        let mut folders = self.folders.lock().expect("folder map mutex poisoned");
        folders.insert(handle.folder_path.clone(), handle);
    }

    pub fn unregister_folder(&self, folder_path: &str) {
        let mut folders = self.folders.lock().expect("folder map mutex poisoned");
        folders.remove(folder_path);
    }

    pub fn folder(&self, folder_path: &str) -> ApiResult<FolderHandle> {
        let folders = self.folders.lock().expect("folder map mutex poisoned");
        folders
            .get(folder_path)
            .cloned()
            .ok_or_else(|| LocalApiError::FolderNotFound {
                folder: folder_path.to_string(),
            })
    }

    pub fn folder_handles(&self) -> Vec<FolderHandle> {
        let folders = self.folders.lock().expect("folder map mutex poisoned");
        let mut handles: Vec<FolderHandle> = folders.values().cloned().collect();
        handles.sort_by(|left, right| left.folder_path.cmp(&right.folder_path));
        handles
    }

    pub fn request_refresh(&self, request: RefreshRequest) {
        let _ = self.refresh_tx.send(request);
    }
}
