use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use fmdm::{Fmdm, FolderStatus, FolderView};
use folder_lifecycle::{event_channel, FolderLifecycle, LifecycleEvent};
use folder_watch::{start_folder_watch, FolderWatcherHandle, WatchConfig};
use indexing::{IndexingPipeline, ParserRegistry, PipelineConfig};
use local_api::{ApiState, FolderHandle, RefreshRequest};
use model_catalog::Catalog;
use model_fetch::DownloadManager;
use resource_manager::{ResourceLimits, ResourceManager};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use vector_store::VectorStore;

use crate::{
    config::{default_cache_dir, Config},
    driver::{DriverSignal, FolderDriver},
    http::{build_router, ControlMessage, HttpState},
};

const PID_FILE_NAME: &str = "daemon.pid";

pub struct Daemon {
    config: Config,
    port: u16,
    pid_file: PathBuf,
    fmdm: Arc<Fmdm>,
    resources: Arc<ResourceManager>,
    api: Arc<ApiState>,
    catalog: Arc<Catalog>,
    capabilities: model_catalog::HostCapabilities,
    driver_signals: HashMap<String, mpsc::UnboundedSender<DriverSignal>>,
    shutdown_tx: watch::Sender<bool>,
    watchers: Vec<FolderWatcherHandle>,
    driver_handles: Vec<JoinHandle<()>>,
    pump_handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Explicit construction graph: every component receives its
    /// collaborators here; nothing is looked up at call sites.
    pub async fn build(config: Config, extra_folders: Vec<PathBuf>) -> Result<Self> {
        let catalog = Catalog::load()?;
        let capabilities = model_catalog::detect_capabilities()?;
        tracing::info!(
            cores = capabilities.cpu_cores,
            ram_mib = capabilities.ram_mib,
            gpu_vram_mib = capabilities.gpu_vram_mib(),
            "host capabilities"
        );

        let mut folder_roots: Vec<PathBuf> = Vec::new();
        for entry in &config.folders {
            folder_roots.push(entry.path.clone());
        }
        for extra in extra_folders {
            if !folder_roots.contains(&extra) {
                folder_roots.push(extra);
            }
        }

        let mut canonical_roots = Vec::new();
        for root in folder_roots {
            let canonical = fs::canonicalize(&root)
                .with_context(|| format!("Folder does not exist: {}", root.display()))?;
            let key = normalize_path(&canonical);
            if !canonical_roots
                .iter()
                .any(|(_, existing): &(PathBuf, String)| existing == &key)
            {
                canonical_roots.push((canonical, key));
            }
        }

        let active_model =
            crate::provider::resolve_active_model(&config.model, &catalog, &capabilities)?;
        tracing::info!(model = active_model.as_str(), "active embedding model");

        let fmdm = Fmdm::new();
        for (_root, key) in &canonical_roots {
            fmdm.upsert_folder(FolderView {
                path: key.clone(),
                model: active_model.clone(),
                status: FolderStatus::Pending,
                progress: None,
                error: None,
            });
        }

        let downloads = DownloadManager::new(default_cache_dir()?);

        // The provider instance is shared by every folder; a missing model
        // file is fetched once while the folders report downloading-model.
        let model_on_disk = catalog.find(&active_model).map(|model| {
            downloads
                .model_file_path(&model.id, &model.download_url)
                .exists()
        });
        if model_on_disk == Some(false) {
            for (_root, key) in &canonical_roots {
                fmdm.update_folder_status(key, FolderStatus::DownloadingModel);
            }
        }

        let embedder =
            match crate::provider::build_embedder(&active_model, &catalog, &capabilities, &downloads)
                .await
            {
                Ok(embedder) => embedder,
                Err(error) => {
                    for (_root, key) in &canonical_roots {
                        fmdm.update_folder_error(key, error.to_string());
                    }
                    return Err(error);
                }
            };

        let resources = ResourceManager::new(ResourceLimits {
            max_concurrent_operations: config.resources.max_concurrent_operations,
            max_queue_size: config.resources.max_queue_size,
            max_memory_bytes: config.resources.max_memory_bytes,
        });

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let api = ApiState::new(Arc::clone(&fmdm), Arc::clone(&embedder), refresh_tx);
        let pipeline = Arc::new(IndexingPipeline::new(
            ParserRegistry::with_builtin_parsers(),
            Arc::clone(&embedder),
            PipelineConfig::default(),
        ));

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let mut daemon = Self {
            port: config.daemon.port,
            pid_file: config
                .daemon
                .pid_file
                .clone()
                .unwrap_or(default_cache_dir()?.join(PID_FILE_NAME)),
            config,
            catalog: Arc::new(catalog),
            capabilities,
            fmdm,
            resources,
            api,
            driver_signals: HashMap::new(),
            shutdown_tx,
            watchers: Vec::new(),
            driver_handles: Vec::new(),
            pump_handles: Vec::new(),
        };

        for (root, key) in canonical_roots {
            daemon.spawn_folder(&root, &key, &active_model, &pipeline)?;
        }
        daemon.spawn_refresh_pump(refresh_rx);

        Ok(daemon)
    }

    pub fn api(&self) -> Arc<ApiState> {
        Arc::clone(&self.api)
    }

    fn spawn_folder(
        &mut self,
        root: &Path,
        key: &str,
        model: &str,
        pipeline: &Arc<IndexingPipeline>,
    ) -> Result<()> {
        let store = match VectorStore::open(root, model, self.api.embedder().dimension()) {
            Ok(store) => Arc::new(Mutex::new(store)),
            Err(error) => {
                // Model or dimension drift blocks this folder but not the
                // daemon; the folder surfaces the fatal error via FMDM.
                tracing::error!(folder = key, %error, "failed to open folder database");
                self.fmdm.update_folder_error(key, error.to_string());
                return Ok(());
            }
        };

        let (event_tx, mut event_rx) = event_channel();
        let lifecycle = FolderLifecycle::new(key, model, 1, event_tx);

        let fmdm = Arc::clone(&self.fmdm);
        self.pump_handles.push(tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    LifecycleEvent::StateChange { path, status } => {
                        fmdm.update_folder_status(&path, status);
                    }
                    LifecycleEvent::Progress { path, progress } => {
                        fmdm.update_folder_progress(&path, progress);
                    }
                }
            }
        }));

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        self.driver_signals.insert(key.to_string(), signal_tx.clone());

        match start_folder_watch(root, WatchConfig::default(), move |_batch| {
            let _ = signal_tx.send(DriverSignal::Rescan);
        }) {
            Ok(handle) => self.watchers.push(handle),
            Err(error) => {
                tracing::warn!(folder = key, %error, "file watching unavailable; relying on manual rescans");
            }
        }

        self.api.register_folder(FolderHandle {
            folder_path: key.to_string(),
            root: root.to_path_buf(),
            store: Arc::clone(&store),
        });

        let driver = FolderDriver {
            root: root.to_path_buf(),
            lifecycle,
            store,
            pipeline: Arc::clone(pipeline),
            resources: Arc::clone(&self.resources),
            signals: signal_rx,
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.driver_handles.push(tokio::spawn(driver.run()));

        Ok(())
    }

    fn spawn_refresh_pump(&mut self, mut refresh_rx: mpsc::UnboundedReceiver<RefreshRequest>) {
        let signals = self.driver_signals.clone();
        self.pump_handles.push(tokio::spawn(async move {
            while let Some(request) = refresh_rx.recv().await {
                match signals.get(&request.folder_path) {
                    Some(tx) => {
                        let _ = tx.send(DriverSignal::Rescan);
                    }
                    None => {
                        tracing::warn!(
                            folder = request.folder_path.as_str(),
                            "refresh requested for unknown folder"
                        );
                    }
                }
            }
        }));
    }

    /// Serve the local socket until a stop request or Ctrl-C arrives.
    pub async fn run(mut self) -> Result<()> {
        self.write_pid_file()?;

        let (control_tx, mut control_rx) = mpsc::channel(8);
        let http_state = HttpState {
            api: Arc::clone(&self.api),
            resources: Arc::clone(&self.resources),
            catalog: Arc::clone(&self.catalog),
            capabilities: self.capabilities.clone(),
            control_tx,
            started_at: Instant::now(),
            health_check: self.config.daemon.health_check,
            performance: self.config.daemon.performance,
        };
        let router = build_router(http_state);

        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .with_context(|| format!("Failed to bind local socket on port {}", self.port))?;
        tracing::info!(port = self.port, "local RPC listening");

        let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown_rx.await;
                })
                .await
        });

        let force = loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(error) = signal {
                        tracing::warn!(%error, "signal handler failed");
                    }
                    break false;
                }
                message = control_rx.recv() => match message {
                    Some(ControlMessage::Stop { force }) => break force,
                    Some(ControlMessage::Reload) => self.reload(),
                    None => break false,
                }
            }
        };

        self.shutdown(force).await;

        let _ = http_shutdown_tx.send(());
        let _ = server.await;
        self.remove_pid_file();

        Ok(())
    }

    /// Re-read the folder list from disk and rescan everything.
    fn reload(&mut self) {
        match Config::load() {
            Ok(config) => {
                tracing::info!(
                    folders = config.folders.len(),
                    "configuration reloaded; rescanning folders"
                );
                self.config = config;
            }
            Err(error) => {
                tracing::error!(%error, "configuration reload failed; keeping current settings");
            }
        }

        for (folder, tx) in &self.driver_signals {
            tracing::debug!(folder = folder.as_str(), "rescan requested by reload");
            let _ = tx.send(DriverSignal::Rescan);
        }
    }

    async fn shutdown(&mut self, force: bool) {
        tracing::info!(force, "daemon shutting down");

        self.resources.shutdown(force).await;
        let _ = self.shutdown_tx.send(true);

        for watcher in self.watchers.drain(..) {
            if let Err(error) = watcher.stop() {
                tracing::warn!(%error, "watcher failed to stop cleanly");
            }
        }

        for handle in self.driver_handles.drain(..) {
            if force {
                handle.abort();
            } else if let Err(error) =
                tokio::time::timeout(Duration::from_secs(10), handle).await
            {
                tracing::warn!(%error, "folder driver did not drain in time");
            }
        }

        for handle in self.pump_handles.drain(..) {
            handle.abort();
        }

        // Final snapshot so late subscribers observe the terminal state.
        let snapshot = self.fmdm.get_fmdm();
        tracing::info!(folders = snapshot.folders.len(), "final folder snapshot flushed");
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create pid file directory {}", parent.display())
            })?;
        }
        fs::write(&self.pid_file, std::process::id().to_string())
            .with_context(|| format!("Failed to write pid file {}", self.pid_file.display()))?;
        Ok(())
    }

    fn remove_pid_file(&self) {
        let _ = fs::remove_file(&self.pid_file);
    }
}

pub fn normalize_path(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    normalized.trim_end_matches('/').to_string()
}
