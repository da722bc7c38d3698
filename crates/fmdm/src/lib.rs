//! Folder/Model Data Map: the authoritative in-memory snapshot of every
//! registered folder, broadcast to clients on each mutation.
//!
//! The snapshot lives behind one mutex. Subscribers receive cloned snapshot
//! values over unbounded channels, never shared references, and the channel
//! sends happen after the lock is released so a slow listener cannot wedge a
//! mutation. Dropping a [`Subscription`] unsubscribes.

use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderStatus {
    Pending,
    Scanning,
    Ready,
    Indexing,
    Active,
    Error,
    DownloadingModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u8,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let completed = completed.min(total);
        let percentage = if total == 0 {
            0
        } else {
            ((completed * 100) / total) as u8
        };

        Self {
            completed,
            total,
            percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderView {
    pub path: String,
    pub model: String,
    pub status: FolderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderModelDataMap {
    pub folders: Vec<FolderView>,
}

struct Subscriber {
    id: u64,
    tx: UnboundedSender<FolderModelDataMap>,
}

#[derive(Default)]
struct Inner {
    snapshot: FolderModelDataMap,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

#[derive(Default)]
pub struct Fmdm {
    inner: Mutex<Inner>,
}

/// Receiving half of a subscription. Dropping it removes the subscriber.
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<FolderModelDataMap>,
    fmdm: Weak<Fmdm>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<FolderModelDataMap> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FolderModelDataMap> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fmdm) = self.fmdm.upgrade() {
            let mut inner = fmdm.inner.lock().expect("fmdm mutex poisoned");
            inner.subscribers.retain(|subscriber| subscriber.id != self.id);
        }
    }
}

impl Fmdm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_fmdm(&self) -> FolderModelDataMap {
        self.inner.lock().expect("fmdm mutex poisoned").snapshot.clone()
    }

    /// Replace the entire folder list (used at registration changes).
    pub fn update_folders(self: &Arc<Self>, folders: Vec<FolderView>) {
        self.mutate(|snapshot| {
            snapshot.folders = folders;
            true
        });
    }

    pub fn upsert_folder(self: &Arc<Self>, view: FolderView) {
        self.mutate(|snapshot| {
            if let Some(existing) = snapshot
                .folders
                .iter_mut()
                .find(|folder| folder.path == view.path)
            {
                *existing = view;
            } else {
                snapshot.folders.push(view);
            }
            true
        });
    }

    pub fn remove_folder(self: &Arc<Self>, path: &str) {
        self.mutate(|snapshot| {
            let before = snapshot.folders.len();
            snapshot.folders.retain(|folder| folder.path != path);
            snapshot.folders.len() != before
        });
    }

    pub fn update_folder_status(self: &Arc<Self>, path: &str, status: FolderStatus) {
        self.mutate(|snapshot| {
            let Some(folder) = snapshot.folders.iter_mut().find(|folder| folder.path == path)
            else {
                tracing::warn!(path, "status update for unknown folder ignored");
                return false;
            };

            folder.status = status;
            if status != FolderStatus::Error {
                folder.error = None;
            }
            true
        });
    }

    pub fn update_folder_progress(self: &Arc<Self>, path: &str, progress: Progress) {
        self.mutate(|snapshot| {
            let Some(folder) = snapshot.folders.iter_mut().find(|folder| folder.path == path)
            else {
                tracing::warn!(path, "progress update for unknown folder ignored");
                return false;
            };

            folder.progress = Some(progress);
            true
        });
    }

    pub fn update_folder_error(self: &Arc<Self>, path: &str, message: String) {
        self.mutate(|snapshot| {
            let Some(folder) = snapshot.folders.iter_mut().find(|folder| folder.path == path)
            else {
                return false;
            };

            folder.status = FolderStatus::Error;
            folder.error = Some(message);
            true
        });
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().expect("fmdm mutex poisoned");
            inner.next_subscriber_id += 1;
            let id = inner.next_subscriber_id;
            inner.subscribers.push(Subscriber { id, tx });
            id
        };

        Subscription {
            id,
            rx,
            fmdm: Arc::downgrade(self),
        }
    }

    /// Apply a mutation and, if it changed anything, broadcast one snapshot
    /// clone per subscriber. Sends happen outside the lock.
    fn mutate(self: &Arc<Self>, apply: impl FnOnce(&mut FolderModelDataMap) -> bool) {
        let (snapshot, channels) = {
            let mut inner = self.inner.lock().expect("fmdm mutex poisoned");
            if !apply(&mut inner.snapshot) {
                return;
            }

            inner
                .subscribers
                .retain(|subscriber| !subscriber.tx.is_closed());

            let snapshot = inner.snapshot.clone();
            let channels: Vec<UnboundedSender<FolderModelDataMap>> = inner
                .subscribers
                .iter()
                .map(|subscriber| subscriber.tx.clone())
                .collect();
            (snapshot, channels)
        };

        for tx in channels {
            let _ = tx.send(snapshot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Fmdm, FolderStatus, FolderView, Progress};

    fn view(path: &str, status: FolderStatus) -> FolderView {
        FolderView {
            path: path.to_string(),
            model: "test-model".to_string(),
            status,
            progress: None,
            error: None,
        }
    }

    #[test]
    fn progress_percentage_rounds_down_and_clamps() {
        assert_eq!(Progress::new(1, 3).percentage, 33);
        assert_eq!(Progress::new(2, 3).percentage, 66);
        assert_eq!(Progress::new(3, 3).percentage, 100);
        assert_eq!(Progress::new(0, 0).percentage, 0);

        let clamped = Progress::new(5, 3);
        assert_eq!(clamped.completed, 3);
        assert_eq!(clamped.percentage, 100);
    }

    #[test]
    fn folders_are_independent_and_both_visible() {
        let fmdm = Fmdm::new();
        let mut subscription = fmdm.subscribe();

        fmdm.upsert_folder(view("/f1", FolderStatus::Pending));
        fmdm.upsert_folder(view("/f2", FolderStatus::Pending));
        fmdm.update_folder_status("/f1", FolderStatus::Indexing);
        fmdm.update_folder_status("/f2", FolderStatus::Active);

        let snapshot = fmdm.get_fmdm();
        assert_eq!(snapshot.folders.len(), 2);
        assert_eq!(snapshot.folders[0].status, FolderStatus::Indexing);
        assert_eq!(snapshot.folders[1].status, FolderStatus::Active);

        let mut broadcasts = 0;
        while subscription.try_recv().is_some() {
            broadcasts += 1;
        }
        assert_eq!(broadcasts, 4, "each mutation broadcasts exactly once");
    }

    #[test]
    fn dropped_subscription_stops_receiving() {
        let fmdm = Fmdm::new();
        let subscription = fmdm.subscribe();
        drop(subscription);

        fmdm.upsert_folder(view("/f1", FolderStatus::Pending));

        let mut late = fmdm.subscribe();
        fmdm.update_folder_status("/f1", FolderStatus::Scanning);
        let snapshot = late.try_recv().expect("live subscriber should receive");
        assert_eq!(snapshot.folders[0].status, FolderStatus::Scanning);
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn unknown_folder_updates_do_not_broadcast() {
        let fmdm = Fmdm::new();
        let mut subscription = fmdm.subscribe();

        fmdm.update_folder_status("/missing", FolderStatus::Active);
        fmdm.update_folder_progress("/missing", Progress::new(1, 2));

        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn error_update_sets_status_and_message() {
        let fmdm = Fmdm::new();
        fmdm.upsert_folder(view("/f1", FolderStatus::Indexing));
        fmdm.update_folder_error("/f1", "scan failed".to_string());

        let snapshot = fmdm.get_fmdm();
        assert_eq!(snapshot.folders[0].status, FolderStatus::Error);
        assert_eq!(snapshot.folders[0].error.as_deref(), Some("scan failed"));

        // Leaving the error state clears the message.
        fmdm.update_folder_status("/f1", FolderStatus::Scanning);
        assert!(fmdm.get_fmdm().folders[0].error.is_none());
    }

    #[test]
    fn snapshot_serializes_with_kebab_case_statuses() {
        let json = serde_json::to_string(&view("/f1", FolderStatus::DownloadingModel))
            .expect("view should serialize");
        assert!(json.contains("downloading-model"));
    }
}
