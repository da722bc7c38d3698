use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, SyncSender},
        Arc,
    },
    thread::JoinHandle,
};

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};

use crate::{
    path::canonicalize_folder_root,
    types::{ChangeBatch, FolderWatchError, WatchConfig},
    worker::{spawn_worker, WorkerMessage},
};

/// Everything a live watch owns. Teardown always consumes the whole session
/// so there is exactly one shutdown order: silence the OS watcher, tell the
/// worker to drain, join it.
struct WatchSession {
    watcher: RecommendedWatcher,
    worker_tx: SyncSender<WorkerMessage>,
    worker_thread: JoinHandle<()>,
}

fn shutdown_session(session: WatchSession) -> Result<(), FolderWatchError> {
    let WatchSession {
        watcher,
        worker_tx,
        worker_thread,
    } = session;

    // No new events once the watcher is gone; the worker then flushes what it
    // holds and exits.
    drop(watcher);
    let _ = worker_tx.send(WorkerMessage::Stop);
    worker_thread
        .join()
        .map_err(|_| FolderWatchError::WorkerJoin)
}

/// Running watch. `stop` (or dropping the handle) guarantees no batch is
/// delivered afterwards.
pub struct FolderWatcherHandle {
    session: Option<WatchSession>,
}

impl FolderWatcherHandle {
    pub fn stop(mut self) -> Result<(), FolderWatchError> {
        match self.session.take() {
            Some(session) => shutdown_session(session),
            None => Ok(()),
        }
    }
}

impl Drop for FolderWatcherHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = shutdown_session(session);
        }
    }
}

pub fn start_folder_watch(
    folder_root: impl AsRef<Path>,
    config: WatchConfig,
    on_batch: impl FnMut(ChangeBatch) + Send + 'static,
) -> Result<FolderWatcherHandle, FolderWatchError> {
    let config = config.normalized();
    let folder_root = canonicalize_folder_root(folder_root.as_ref())?;
    let recursive_mode = if config.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };

    let (events_tx, events_rx) = mpsc::sync_channel(config.channel_capacity);
    let rescan_flag = Arc::new(AtomicBool::new(false));

    // The notify callback does one thing: forward the raw event. Anything it
    // cannot forward (overflow, backend error) degrades to a rescan request
    // the worker picks up on its next wake.
    let forward_tx = events_tx.clone();
    let overflow_flag = Arc::clone(&rescan_flag);
    let watcher = RecommendedWatcher::new(
        move |outcome: notify::Result<notify::Event>| {
            let forwarded = match outcome {
                Ok(event) => forward_tx.try_send(WorkerMessage::RawEvent(event)).is_ok(),
                Err(_) => false,
            };
            if !forwarded {
                overflow_flag.store(true, Ordering::SeqCst);
            }
        },
        Config::default(),
    )?;

    let worker_thread = spawn_worker(
        folder_root.clone(),
        config,
        events_rx,
        rescan_flag,
        Box::new(on_batch),
    );

    let mut session = WatchSession {
        watcher,
        worker_tx: events_tx,
        worker_thread,
    };

    if let Err(source) = session.watcher.watch(&folder_root, recursive_mode) {
        let path = folder_root.display().to_string();
        let _ = shutdown_session(session);
        return Err(FolderWatchError::WatchPath { path, source });
    }

    Ok(FolderWatcherHandle {
        session: Some(session),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        sync::mpsc,
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use crate::{start_folder_watch, ChangeBatch, WatchConfig};

    fn create_temp_folder() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        dir.push(format!("folder-watch-test-{nanos}"));
        fs::create_dir_all(&dir).expect("temp folder should be created");
        dir
    }

    #[test]
    fn emits_relative_paths_for_changes_inside_folder() {
        let folder = create_temp_folder();
        let nested = folder.join("docs");
        fs::create_dir_all(&nested).expect("nested dir should be created");

        let (tx, rx) = mpsc::channel::<ChangeBatch>();
        let watcher = start_folder_watch(
            &folder,
            WatchConfig {
                debounce_ms: 50,
                ..WatchConfig::default()
            },
            move |batch| {
                let _ = tx.send(batch);
            },
        )
        .expect("watcher should start");

        let file_path = nested.join("note.md");
        fs::write(&file_path, "# note").expect("file should be written");

        let mut got_relative = false;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if let Ok(batch) = rx.recv_timeout(Duration::from_millis(300)) {
                let mut all_paths = batch.rel_created;
                all_paths.extend(batch.rel_modified);
                all_paths.extend(batch.rel_removed);

                if all_paths.iter().any(|path| path == "docs/note.md") {
                    assert!(all_paths.iter().all(|path| !path.starts_with('/')));
                    got_relative = true;
                    break;
                }
            }
        }

        watcher.stop().expect("watcher should stop");
        let _ = fs::remove_dir_all(&folder);
        assert!(
            got_relative,
            "should receive relative path event for docs/note.md"
        );
    }

    #[test]
    fn stop_prevents_later_event_delivery() {
        let folder = create_temp_folder();
        let (tx, rx) = mpsc::channel::<ChangeBatch>();
        let watcher = start_folder_watch(
            &folder,
            WatchConfig {
                debounce_ms: 50,
                ..WatchConfig::default()
            },
            move |batch| {
                let _ = tx.send(batch);
            },
        )
        .expect("watcher should start");

        watcher.stop().expect("watcher should stop");

        let file_path = folder.join("after-stop.md");
        fs::write(&file_path, "content").expect("file should be written");

        let received = rx.recv_timeout(Duration::from_millis(700)).is_ok();
        let _ = fs::remove_dir_all(&folder);
        assert!(!received, "no batch should arrive after stop");
    }
}
