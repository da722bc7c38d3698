//! Per-folder lifecycle orchestration.
//!
//! Each registered folder owns one [`FolderLifecycle`]: a state machine that
//! moves through `pending → scanning → ready → indexing → active`, with
//! `error` and `downloading-model` branches. Scan diffs become embedding
//! tasks, tasks are offered to the resource manager one at a time, and every
//! state or progress change is emitted on a typed channel that FMDM consumes.
//! The struct is exclusively owned by its folder's driver; nothing here is
//! shared mutable state.

use std::time::SystemTime;

use fmdm::{FolderStatus, Progress};
use folder_scan::{ChangeKind, FileChangeInfo};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Per-task retry bound. A task that fails more often than this is terminal.
pub const MAX_TASK_RETRIES: u32 = 3;

/// Consecutive terminal failures that push the whole folder into `error`.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

const BASE_TASK_MEMORY_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    CreateEmbeddings,
    UpdateEmbeddings,
    RemoveEmbeddings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub path: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub priority: u8,
    pub estimated_memory_bytes: u64,
    #[serde(skip)]
    pub change: FileChangeInfo,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    StateChange {
        path: String,
        status: FolderStatus,
    },
    Progress {
        path: String,
        progress: Progress,
    },
}

pub fn event_channel() -> (
    UnboundedSender<LifecycleEvent>,
    UnboundedReceiver<LifecycleEvent>,
) {
    mpsc::unbounded_channel()
}

pub struct FolderLifecycle {
    folder_path: String,
    model_id: String,
    priority: u8,
    status: FolderStatus,
    tasks: Vec<EmbeddingTask>,
    consecutive_errors: u32,
    error_message: Option<String>,
    last_scan_started: Option<SystemTime>,
    last_index_started: Option<SystemTime>,
    events: UnboundedSender<LifecycleEvent>,
}

impl FolderLifecycle {
    pub fn new(
        folder_path: &str,
        model_id: &str,
        priority: u8,
        events: UnboundedSender<LifecycleEvent>,
    ) -> Self {
        Self {
            folder_path: folder_path.to_string(),
            model_id: model_id.to_string(),
            priority,
            status: FolderStatus::Pending,
            tasks: Vec::new(),
            consecutive_errors: 0,
            error_message: None,
            last_scan_started: None,
            last_index_started: None,
            events,
        }
    }

    pub fn folder_path(&self) -> &str {
        &self.folder_path
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn status(&self) -> FolderStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn tasks(&self) -> &[EmbeddingTask] {
        &self.tasks
    }

    pub fn last_scan_started(&self) -> Option<SystemTime> {
        self.last_scan_started
    }

    pub fn last_index_started(&self) -> Option<SystemTime> {
        self.last_index_started
    }

    /// Terminal tasks (done or failed) over the full task count. Failed tasks
    /// count as finished work so a folder with skipped files still converges
    /// to 100%.
    pub fn progress(&self) -> Progress {
        let finished = self
            .tasks
            .iter()
            .filter(|task| task.status.is_terminal())
            .count();
        Progress::new(finished, self.tasks.len())
    }

    /// `pending → scanning`, or `active → scanning` after a watcher event.
    pub fn begin_scan(&mut self) -> bool {
        if !matches!(
            self.status,
            FolderStatus::Pending | FolderStatus::Active | FolderStatus::Error
        ) {
            tracing::warn!(
                folder = self.folder_path.as_str(),
                status = ?self.status,
                "ignoring scan request in current state"
            );
            return false;
        }

        self.last_scan_started = Some(SystemTime::now());
        self.error_message = None;
        self.set_status(FolderStatus::Scanning);
        true
    }

    /// Feed the scan diff in. No changes sends the folder straight to
    /// `active`; otherwise tasks are produced and the folder is `ready`.
    pub fn complete_scan(&mut self, changes: Vec<FileChangeInfo>) {
        if self.status != FolderStatus::Scanning {
            tracing::warn!(
                folder = self.folder_path.as_str(),
                status = ?self.status,
                "scan completion in unexpected state"
            );
        }

        self.tasks = produce_tasks(&changes, self.priority);
        self.consecutive_errors = 0;

        if self.tasks.is_empty() {
            self.set_status(FolderStatus::Active);
        } else {
            self.set_status(FolderStatus::Ready);
        }
        self.emit_progress();
    }

    pub fn fail_scan(&mut self, message: &str) {
        self.error_message = Some(message.to_string());
        self.set_status(FolderStatus::Error);
    }

    /// `ready → indexing`.
    pub fn start_indexing(&mut self) -> bool {
        if self.status != FolderStatus::Ready {
            return false;
        }

        self.last_index_started = Some(SystemTime::now());
        self.set_status(FolderStatus::Indexing);
        true
    }

    /// The selected model is not on disk; indexing waits for the download.
    pub fn model_missing(&mut self) {
        self.set_status(FolderStatus::DownloadingModel);
    }

    /// `downloading-model → indexing`.
    pub fn model_ready(&mut self) {
        if self.status != FolderStatus::DownloadingModel {
            return;
        }

        self.last_index_started = Some(SystemTime::now());
        self.set_status(FolderStatus::Indexing);
    }

    pub fn model_download_failed(&mut self, message: &str) {
        self.error_message = Some(message.to_string());
        self.set_status(FolderStatus::Error);
    }

    /// Hand out the next runnable task and mark it running.
    ///
    /// A task is runnable when it is pending and no earlier non-terminal task
    /// targets the same path, which keeps `RemoveEmbeddings` ahead of a later
    /// `CreateEmbeddings` for one file.
    pub fn next_task(&mut self) -> Option<EmbeddingTask> {
        let index = self.tasks.iter().position(|task| {
            task.status == TaskStatus::Pending
                && !self.tasks.iter().any(|earlier| {
                    earlier.id != task.id
                        && earlier.path == task.path
                        && !earlier.status.is_terminal()
                        && task_position(&self.tasks, earlier.id) < task_position(&self.tasks, task.id)
                })
        })?;

        self.tasks[index].status = TaskStatus::Running;
        Some(self.tasks[index].clone())
    }

    pub fn on_task_done(&mut self, task_id: Uuid) {
        let Some(task) = self.tasks.iter_mut().find(|task| task.id == task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }

        task.status = TaskStatus::Done;
        task.last_error = None;
        self.consecutive_errors = 0;
        self.emit_progress();
        self.finish_if_drained();
    }

    /// Failed tasks re-queue until the retry bound, then become terminal.
    /// Terminal failures accumulate toward the folder error threshold.
    pub fn on_task_failed(&mut self, task_id: Uuid, message: &str) {
        let Some(task) = self.tasks.iter_mut().find(|task| task.id == task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }

        task.last_error = Some(message.to_string());
        if task.retry_count < MAX_TASK_RETRIES {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            tracing::info!(
                folder = self.folder_path.as_str(),
                path = task.path.as_str(),
                retry = task.retry_count,
                "task returned to queue"
            );
            return;
        }

        task.status = TaskStatus::Failed;
        self.consecutive_errors += 1;
        tracing::error!(
            folder = self.folder_path.as_str(),
            path = task.path.as_str(),
            error = message,
            "task failed terminally"
        );
        self.emit_progress();

        if self.consecutive_errors > MAX_CONSECUTIVE_ERRORS {
            self.error_message = Some(format!(
                "{} consecutive task failures, last: {}",
                self.consecutive_errors, message
            ));
            self.set_status(FolderStatus::Error);
            return;
        }

        self.finish_if_drained();
    }

    /// Watcher activity on an `active` folder requests a fresh scan.
    pub fn on_watcher_event(&mut self) -> bool {
        if self.status != FolderStatus::Active {
            return false;
        }
        self.begin_scan()
    }

    fn finish_if_drained(&mut self) {
        let drained = self
            .tasks
            .iter()
            .all(|task| task.status.is_terminal());
        if drained && self.status == FolderStatus::Indexing {
            self.set_status(FolderStatus::Active);
        }
    }

    fn set_status(&mut self, status: FolderStatus) {
        if self.status == status {
            return;
        }

        tracing::debug!(
            folder = self.folder_path.as_str(),
            from = ?self.status,
            to = ?status,
            "folder state change"
        );
        self.status = status;
        let _ = self.events.send(LifecycleEvent::StateChange {
            path: self.folder_path.clone(),
            status,
        });
    }

    fn emit_progress(&self) {
        let _ = self.events.send(LifecycleEvent::Progress {
            path: self.folder_path.clone(),
            progress: self.progress(),
        });
    }
}

fn task_position(tasks: &[EmbeddingTask], id: Uuid) -> usize {
    tasks
        .iter()
        .position(|task| task.id == id)
        .unwrap_or(usize::MAX)
}

/// Scan diff → task queue. Removals sort ahead of creations and updates so a
/// replaced path is cleared before it is re-embedded.
fn produce_tasks(changes: &[FileChangeInfo], priority: u8) -> Vec<EmbeddingTask> {
    let mut tasks: Vec<EmbeddingTask> = Vec::with_capacity(changes.len());

    for change in changes.iter().filter(|change| change.kind == ChangeKind::Removed) {
        tasks.push(task_for_change(change, TaskKind::RemoveEmbeddings, priority));
    }
    for change in changes.iter().filter(|change| change.kind != ChangeKind::Removed) {
        let kind = match change.kind {
            ChangeKind::Added => TaskKind::CreateEmbeddings,
            ChangeKind::Modified => TaskKind::UpdateEmbeddings,
            ChangeKind::Removed => unreachable!("removals were queued above"),
        };
        tasks.push(task_for_change(change, kind, priority));
    }

    tasks
}

fn task_for_change(change: &FileChangeInfo, kind: TaskKind, priority: u8) -> EmbeddingTask {
    EmbeddingTask {
        id: Uuid::new_v4(),
        kind,
        path: change.path.clone(),
        status: TaskStatus::Pending,
        retry_count: 0,
        last_error: None,
        priority,
        estimated_memory_bytes: estimate_task_memory(change),
        change: change.clone(),
    }
}

/// Rough working-set estimate: raw bytes plus parse/chunk copies. Binary
/// formats expand more than plain text when their parsers extract content.
fn estimate_task_memory(change: &FileChangeInfo) -> u64 {
    let multiplier = match change.path.rsplit('.').next() {
        Some("pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx") => 6,
        _ => 3,
    };
    BASE_TASK_MEMORY_BYTES + change.size * multiplier
}
