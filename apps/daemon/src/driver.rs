use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use folder_lifecycle::{EmbeddingTask, FolderLifecycle, TaskKind};
use folder_scan::KnownFileState;
use indexing::{IndexingPipeline, PipelineError};
use resource_manager::{OperationSpec, ResourceError, ResourceManager};
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use vector_store::VectorStore;

/// Nudges delivered to a folder driver from the watcher, the RPC refresh
/// endpoint, or a daemon reload.
#[derive(Debug, Clone, Copy)]
pub enum DriverSignal {
    Rescan,
}

pub struct FolderDriver {
    pub root: PathBuf,
    pub lifecycle: FolderLifecycle,
    pub store: Arc<Mutex<VectorStore>>,
    pub pipeline: Arc<IndexingPipeline>,
    pub resources: Arc<ResourceManager>,
    pub signals: UnboundedReceiver<DriverSignal>,
    pub shutdown: watch::Receiver<bool>,
}

impl FolderDriver {
    /// Drive the folder until shutdown: scan, index the diff, then sleep on
    /// watcher/refresh signals and repeat.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                return;
            }

            if self.lifecycle.status() != fmdm::FolderStatus::Scanning
                && !self.lifecycle.begin_scan()
            {
                if !self.wait_for_signal().await {
                    return;
                }
                continue;
            }

            self.scan_and_index().await;

            if !self.wait_for_signal().await {
                return;
            }
        }
    }

    async fn scan_and_index(&mut self) {
        let known: std::collections::HashMap<String, KnownFileState> = {
            let store = self.store.lock().expect("store mutex poisoned");
            match store.file_states() {
                Ok(states) => states
                    .into_iter()
                    .map(|(path, state)| {
                        (
                            path,
                            KnownFileState {
                                fingerprint: state.fingerprint,
                                mtime_ns: state.mtime_ns,
                                file_size: state.file_size,
                            },
                        )
                    })
                    .collect(),
                Err(error) => {
                    self.lifecycle.fail_scan(&error.to_string());
                    return;
                }
            }
        };

        let root = self.root.clone();
        let scan_result =
            tokio::task::spawn_blocking(move || folder_scan::detect_changes(&root, &known)).await;

        let changes = match scan_result {
            Ok(Ok(changes)) => changes,
            Ok(Err(error)) => {
                tracing::error!(
                    folder = self.lifecycle.folder_path(),
                    %error,
                    "folder scan failed"
                );
                self.lifecycle.fail_scan(&error.to_string());
                return;
            }
            Err(join_error) => {
                self.lifecycle.fail_scan(&join_error.to_string());
                return;
            }
        };

        // Removed files whose Remove task is superseded: file states carry
        // rows the scanner flagged; the lifecycle owns sequencing from here.
        self.lifecycle.complete_scan(changes);
        if !self.lifecycle.start_indexing() {
            return;
        }

        while let Some(task) = self.lifecycle.next_task() {
            if *self.shutdown.borrow() {
                return;
            }

            if !self.execute_task(task).await {
                return;
            }

            if self.lifecycle.status() == fmdm::FolderStatus::Error {
                return;
            }
        }
    }

    /// Run one task through the resource manager. Returns false when the
    /// driver should stop entirely (shutdown).
    async fn execute_task(&mut self, task: EmbeddingTask) -> bool {
        let spec = OperationSpec {
            id: task.id.to_string(),
            folder: self.lifecycle.folder_path().to_string(),
            priority: task.priority,
            estimated_memory_bytes: task.estimated_memory_bytes,
        };

        let pipeline = Arc::clone(&self.pipeline);
        let store = Arc::clone(&self.store);
        let root = self.root.clone();
        let kind = task.kind;
        let change = task.change.clone();

        let receiver = self.resources.submit(spec, async move {
            match kind {
                TaskKind::RemoveEmbeddings => pipeline.remove(&root, &store, &change.path).await,
                TaskKind::CreateEmbeddings | TaskKind::UpdateEmbeddings => {
                    pipeline.create_or_update(&root, &store, &change).await
                }
            }
        });

        match receiver.await {
            Ok(Ok(Ok(_outcome))) => {
                self.lifecycle.on_task_done(task.id);
                true
            }
            Ok(Ok(Err(error))) => {
                if let PipelineError::Store(store_error) = &error {
                    if store_error.is_fatal() {
                        // Schema or model drift: the folder is unusable until
                        // an operator intervenes.
                        self.lifecycle.fail_scan(&store_error.to_string());
                        return true;
                    }
                }
                self.lifecycle.on_task_failed(task.id, &error.to_string());
                true
            }
            Ok(Err(ResourceError::ForcedShutdown)) | Ok(Err(ResourceError::ShuttingDown)) => false,
            Ok(Err(ResourceError::QueueFull)) => {
                self.lifecycle
                    .on_task_failed(task.id, "resource manager queue is full");
                true
            }
            Err(_closed) => false,
        }
    }

    /// Park until a rescan signal or shutdown. Returns false on shutdown.
    async fn wait_for_signal(&mut self) -> bool {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
                signal = self.signals.recv() => {
                    match signal {
                        Some(DriverSignal::Rescan) => {
                            match self.lifecycle.status() {
                                fmdm::FolderStatus::Active => {
                                    if self.lifecycle.on_watcher_event() {
                                        return true;
                                    }
                                }
                                // Errors are operator-recoverable; a reload or
                                // refresh retries the scan.
                                fmdm::FolderStatus::Error => {
                                    if self.lifecycle.begin_scan() {
                                        return true;
                                    }
                                }
                                _ => return true,
                            }
                        }
                        None => return false,
                    }
                }
            }
        }
    }
}
