use fmdm::FolderView;
use serde::Serialize;
use vector_store::StoreStats;

use crate::{ApiResult, ApiState};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderIngestStatus {
    #[serde(flatten)]
    pub view: FolderView,
    pub stats: StoreStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStatus {
    pub folders: Vec<FolderIngestStatus>,
}

/// The authoritative folder list, straight from FMDM.
pub fn list_folders(state: &ApiState) -> Vec<FolderView> {
    state.fmdm().get_fmdm().folders
}

/// FMDM snapshot joined with per-folder store statistics.
pub fn ingest_status(state: &ApiState) -> ApiResult<IngestStatus> {
    let snapshot = state.fmdm().get_fmdm();

    let mut folders = Vec::with_capacity(snapshot.folders.len());
    for view in snapshot.folders {
        let stats = match state.folder(&view.path) {
            Ok(handle) => {
                let store = handle.store.lock().expect("store mutex poisoned");
                store.stats()?
            }
            // Folder is registered but its store has not come up yet.
            Err(_) => StoreStats::default(),
        };

        folders.push(FolderIngestStatus { view, stats });
    }

    Ok(IngestStatus { folders })
}

#[cfg(test)]
mod tests {
    use fmdm::{FolderStatus, FolderView};

    use super::{ingest_status, list_folders};
    use crate::services::test_support::ApiHarness;

    #[tokio::test]
    async fn folder_list_reflects_fmdm() {
        let harness = ApiHarness::new("api-status-list");
        harness.seed_document("/f1", "a.md", "Some content.");

        harness.state.fmdm().upsert_folder(FolderView {
            path: "/f1".to_string(),
            model: "test-model".to_string(),
            status: FolderStatus::Active,
            progress: None,
            error: None,
        });

        let folders = list_folders(&harness.state);
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].status, FolderStatus::Active);
    }

    #[tokio::test]
    async fn ingest_status_joins_store_stats() {
        let harness = ApiHarness::new("api-status-ingest");
        harness.seed_document("/f1", "a.md", "Some content to count.");

        harness.state.fmdm().upsert_folder(FolderView {
            path: "/f1".to_string(),
            model: "test-model".to_string(),
            status: FolderStatus::Active,
            progress: None,
            error: None,
        });
        // A folder FMDM knows about but whose store never registered.
        harness.state.fmdm().upsert_folder(FolderView {
            path: "/ghost".to_string(),
            model: "test-model".to_string(),
            status: FolderStatus::Pending,
            progress: None,
            error: None,
        });

        let status = ingest_status(&harness.state).expect("status should build");
        assert_eq!(status.folders.len(), 2);

        let live = status
            .folders
            .iter()
            .find(|folder| folder.view.path == "/f1")
            .expect("live folder present");
        assert_eq!(live.stats.documents, 1);
        assert!(live.stats.chunks >= 1);

        let ghost = status
            .folders
            .iter()
            .find(|folder| folder.view.path == "/ghost")
            .expect("ghost folder present");
        assert_eq!(ghost.stats.documents, 0);
    }
}
