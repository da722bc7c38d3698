//! Deduplicated model downloads.
//!
//! Folders request models by id; the manager guarantees at most one download
//! per model id is in flight across the whole process. Every folder that asked
//! for the model while it was downloading receives the same stream of
//! progress/ready/failed events. A model file deleted from the cache simply
//! triggers a fresh download on the next request.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::mpsc::UnboundedSender, sync::Mutex};

const PROGRESS_EVERY_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download failed for model '{model_id}': {message}")]
    DownloadFailed { model_id: String, message: String },

    #[error("downloaded file for model '{model_id}' is truncated ({actual} of {expected} bytes)")]
    Truncated {
        model_id: String,
        actual: u64,
        expected: u64,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress {
        model_id: String,
        downloaded_bytes: u64,
        total_bytes: u64,
    },
    Ready {
        model_id: String,
        path: PathBuf,
    },
    Failed {
        model_id: String,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model_id: String,
    pub download_url: String,
    pub expected_size: u64,
}

struct InFlight {
    subscribers: Vec<(String, UnboundedSender<DownloadEvent>)>,
}

pub struct DownloadManager {
    cache_root: PathBuf,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl DownloadManager {
    /// `cache_root` is normally `~/.cache/folder-mcp`.
    pub fn new(cache_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            cache_root,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Final on-disk location for a model file.
    pub fn model_file_path(&self, model_id: &str, download_url: &str) -> PathBuf {
        let file_name = download_url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("model.bin");

        self.cache_root
            .join("models")
            .join(sanitize_model_id(model_id))
            .join(file_name)
    }

    /// Make sure the model is on disk, subscribing `folder_id` to the events
    /// of whichever download run satisfies the request. If the file is
    /// already present, `Ready` fires immediately.
    pub async fn ensure_model(
        self: &Arc<Self>,
        request: ModelRequest,
        folder_id: String,
        events: UnboundedSender<DownloadEvent>,
    ) {
        let path = self.model_file_path(&request.model_id, &request.download_url);

        if file_is_complete(&path, request.expected_size) {
            let _ = events.send(DownloadEvent::Ready {
                model_id: request.model_id,
                path,
            });
            return;
        }

        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get_mut(&request.model_id) {
                // A download is already running; just join its audience.
                existing.subscribers.push((folder_id, events));
                return;
            }

            in_flight.insert(
                request.model_id.clone(),
                InFlight {
                    subscribers: vec![(folder_id, events)],
                },
            );
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let model_id = request.model_id.clone();
            let result = manager.run_download(&request, &path).await;

            let subscribers = {
                let mut in_flight = manager.in_flight.lock().await;
                in_flight
                    .remove(&model_id)
                    .map(|entry| entry.subscribers)
                    .unwrap_or_default()
            };

            match result {
                Ok(()) => {
                    tracing::info!(model = model_id.as_str(), "model download complete");
                    for (_folder, tx) in &subscribers {
                        let _ = tx.send(DownloadEvent::Ready {
                            model_id: model_id.clone(),
                            path: path.clone(),
                        });
                    }
                }
                Err(error) => {
                    tracing::error!(model = model_id.as_str(), %error, "model download failed");
                    let message = error.to_string();
                    for (_folder, tx) in &subscribers {
                        let _ = tx.send(DownloadEvent::Failed {
                            model_id: model_id.clone(),
                            error: message.clone(),
                        });
                    }
                }
            }
        });
    }

    async fn run_download(&self, request: &ModelRequest, path: &Path) -> Result<(), FetchError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create model directory {}", parent.display()))?;
        }

        let partial_path = path.with_extension("part");
        let mut response = reqwest::get(&request.download_url)
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| FetchError::DownloadFailed {
                model_id: request.model_id.clone(),
                message: error.to_string(),
            })?;

        let total_bytes = response.content_length().unwrap_or(request.expected_size);
        let mut file = tokio::fs::File::create(&partial_path)
            .await
            .with_context(|| format!("Failed to create {}", partial_path.display()))?;

        let mut downloaded: u64 = 0;
        let mut last_reported: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|error| FetchError::DownloadFailed {
                model_id: request.model_id.clone(),
                message: error.to_string(),
            })?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", partial_path.display()))?;
            downloaded += chunk.len() as u64;

            if downloaded - last_reported >= PROGRESS_EVERY_BYTES {
                last_reported = downloaded;
                self.broadcast_progress(&request.model_id, downloaded, total_bytes)
                    .await;
            }
        }

        file.flush()
            .await
            .with_context(|| format!("Failed to flush {}", partial_path.display()))?;
        drop(file);

        if total_bytes > 0 && downloaded < total_bytes {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(FetchError::Truncated {
                model_id: request.model_id.clone(),
                actual: downloaded,
                expected: total_bytes,
            });
        }

        tokio::fs::rename(&partial_path, path)
            .await
            .with_context(|| format!("Failed to move download into place at {}", path.display()))?;

        Ok(())
    }

    async fn broadcast_progress(&self, model_id: &str, downloaded_bytes: u64, total_bytes: u64) {
        let in_flight = self.in_flight.lock().await;
        let Some(entry) = in_flight.get(model_id) else {
            return;
        };

        for (_folder, tx) in &entry.subscribers {
            let _ = tx.send(DownloadEvent::Progress {
                model_id: model_id.to_string(),
                downloaded_bytes,
                total_bytes,
            });
        }
    }
}

fn file_is_complete(path: &Path, expected_size: u64) -> bool {
    match std::fs::metadata(path) {
        Ok(metadata) if expected_size > 0 => metadata.len() == expected_size,
        Ok(metadata) => metadata.len() > 0,
        Err(_) => false,
    }
}

fn sanitize_model_id(model_id: &str) -> String {
    model_id
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '.') {
                character
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use tokio::sync::mpsc;

    use super::{DownloadEvent, DownloadManager, ModelRequest};

    fn temp_cache() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        dir.push(format!("model-fetch-test-{nanos}"));
        dir
    }

    fn request(model_id: &str, url: &str, expected: u64) -> ModelRequest {
        ModelRequest {
            model_id: model_id.to_string(),
            download_url: url.to_string(),
            expected_size: expected,
        }
    }

    #[test]
    fn model_paths_are_sanitized_per_model() {
        let cache = temp_cache();
        let manager = DownloadManager::new(cache.clone());

        let path = manager.model_file_path("ollama:nomic/embed", "https://host/x/model.onnx");
        assert!(path.starts_with(cache.join("models")));
        assert!(path.to_string_lossy().contains("ollama_nomic_embed"));
        assert!(path.ends_with("model.onnx"));
    }

    #[tokio::test]
    async fn existing_file_short_circuits_to_ready() {
        let cache = temp_cache();
        let manager = DownloadManager::new(cache.clone());

        let path = manager.model_file_path("cpu:test", "https://host/model.onnx");
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs should be created");
        fs::write(&path, b"model-bytes").expect("file should be written");

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .ensure_model(
                request("cpu:test", "https://host/model.onnx", 11),
                "/folder-a".to_string(),
                tx,
            )
            .await;

        match rx.try_recv().expect("event should be queued") {
            DownloadEvent::Ready { model_id, path: ready_path } => {
                assert_eq!(model_id, "cpu:test");
                assert_eq!(ready_path, path);
            }
            other => panic!("expected ready event, got {other:?}"),
        }

        let _ = fs::remove_dir_all(&cache);
    }

    #[tokio::test]
    async fn failed_download_fans_out_to_every_subscribed_folder() {
        let cache = temp_cache();
        let manager = DownloadManager::new(cache.clone());

        // Nothing listens on this port; the download fails fast for both
        // folders while only one attempt runs.
        let unreachable = "http://127.0.0.1:9/model.onnx";
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        manager
            .ensure_model(
                request("cpu:down", unreachable, 10),
                "/folder-a".to_string(),
                tx_a,
            )
            .await;
        manager
            .ensure_model(
                request("cpu:down", unreachable, 10),
                "/folder-b".to_string(),
                tx_b,
            )
            .await;

        let deadline = Duration::from_secs(10);
        let event_a = tokio::time::timeout(deadline, rx_a.recv())
            .await
            .expect("folder a should hear back")
            .expect("channel should stay open");
        let event_b = tokio::time::timeout(deadline, rx_b.recv())
            .await
            .expect("folder b should hear back")
            .expect("channel should stay open");

        assert!(matches!(event_a, DownloadEvent::Failed { .. }));
        assert!(matches!(event_b, DownloadEvent::Failed { .. }));

        let _ = fs::remove_dir_all(&cache);
    }
}
