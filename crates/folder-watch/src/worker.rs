use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    normalize::PendingBatch,
    types::{ChangeBatch, WatchConfig},
};

// Upper bound on how long the worker sleeps without waking to look at the
// rescan flag; the flag can be raised without a message ever arriving.
const MAX_WAIT_MS: u64 = 500;

pub(crate) enum WorkerMessage {
    RawEvent(notify::Event),
    Stop,
}

pub(crate) fn spawn_worker(
    folder_root: PathBuf,
    config: WatchConfig,
    rx: Receiver<WorkerMessage>,
    rescan_flag: Arc<AtomicBool>,
    on_batch: Box<dyn FnMut(ChangeBatch) + Send + 'static>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        WatchWorker {
            folder_root,
            debounce: Duration::from_millis(config.debounce_ms),
            max_batch_paths: config.max_batch_paths,
            rx,
            rescan_flag,
            on_batch,
            pending: PendingBatch::default(),
            flush_due_at: None,
            seq: 0,
        }
        .run()
    })
}

/// Coalesces raw notify events into debounced batches.
///
/// The worker keeps one deadline: every event (or rescan request) pushes it
/// `debounce` into the future, and when the clock passes it the accumulated
/// batch goes out. No deadline means nothing is pending.
struct WatchWorker {
    folder_root: PathBuf,
    debounce: Duration,
    max_batch_paths: usize,
    rx: Receiver<WorkerMessage>,
    rescan_flag: Arc<AtomicBool>,
    on_batch: Box<dyn FnMut(ChangeBatch) + Send>,
    pending: PendingBatch,
    flush_due_at: Option<Instant>,
    seq: u64,
}

impl WatchWorker {
    fn run(mut self) {
        let max_wait = Duration::from_millis(MAX_WAIT_MS);

        loop {
            if self.rescan_flag.swap(false, Ordering::SeqCst) {
                self.pending.mark_rescan();
                self.arm_deadline();
            }

            let now = Instant::now();
            if self.flush_due_at.is_some_and(|due| now >= due) {
                self.emit();
                continue;
            }

            let wait = match self.flush_due_at {
                Some(due) => due.saturating_duration_since(now).min(max_wait),
                None => max_wait,
            };

            match self.rx.recv_timeout(wait) {
                Ok(WorkerMessage::RawEvent(event)) => {
                    self.pending.apply_notify_event(&self.folder_root, &event);
                    if self.pending.has_emitable_changes() {
                        self.arm_deadline();
                    }
                }
                Ok(WorkerMessage::Stop) => {
                    if self.rescan_flag.swap(false, Ordering::SeqCst) {
                        self.pending.mark_rescan();
                    }
                    if self.pending.has_emitable_changes() {
                        self.emit();
                    }
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Push the flush deadline out past the newest activity.
    fn arm_deadline(&mut self) {
        self.flush_due_at = Some(Instant::now() + self.debounce);
    }

    fn emit(&mut self) {
        self.flush_due_at = None;
        self.seq += 1;
        if let Some(batch) = self.pending.take_batch(self.seq, self.max_batch_paths) {
            (self.on_batch)(batch);
        }
    }
}
