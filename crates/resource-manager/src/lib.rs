//! Process-wide admission control for lifecycle operations.
//!
//! Every indexing task in the daemon funnels through one manager that
//! enforces the concurrency and memory budgets. Queued operations dispatch in
//! FIFO order within a priority band; a higher priority overtakes the queue
//! but never preempts an operation that is already running. Shutdown comes in
//! two flavors: graceful drains the active set, forced resolves every
//! in-flight submission with [`ResourceError::ForcedShutdown`] immediately.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::{oneshot, Notify};

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_concurrent_operations: usize,
    pub max_queue_size: usize,
    pub max_memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 2,
            max_queue_size: 256,
            max_memory_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub id: String,
    pub folder: String,
    pub priority: u8,
    pub estimated_memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("operation cancelled by forced shutdown")]
    ForcedShutdown,
    #[error("operation queue is full")]
    QueueFull,
    #[error("resource manager is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub active_operations: usize,
    pub queued_operations: usize,
    pub completed: u64,
    pub failed: u64,
}

struct QueuedOperation {
    seq: u64,
    priority: u8,
    estimated_memory_bytes: u64,
    cancel_tx: oneshot::Sender<()>,
    start: Box<dyn FnOnce(Option<ResourceError>) + Send>,
}

struct ActiveOperation {
    estimated_memory_bytes: u64,
    cancel_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    queue: Vec<QueuedOperation>,
    active: HashMap<u64, ActiveOperation>,
    active_memory: u64,
    completed: u64,
    failed: u64,
    next_seq: u64,
    shutting_down: bool,
}

pub struct ResourceManager {
    limits: ResourceLimits,
    state: Mutex<State>,
    drained: Notify,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            state: Mutex::new(State::default()),
            drained: Notify::new(),
        })
    }

    pub fn stats(&self) -> ResourceStats {
        let state = self.state.lock().expect("resource manager mutex poisoned");
        ResourceStats {
            active_operations: state.active.len(),
            queued_operations: state.queue.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Submit an operation. The returned receiver resolves with the
    /// operation's output once it has run, or with a [`ResourceError`] if it
    /// was rejected or cancelled.
    pub fn submit<F, T>(
        self: &Arc<Self>,
        spec: OperationSpec,
        work: F,
    ) -> oneshot::Receiver<Result<T, ResourceError>>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        {
            let mut state = self.state.lock().expect("resource manager mutex poisoned");

            if state.shutting_down {
                drop(state);
                let _ = result_tx.send(Err(ResourceError::ShuttingDown));
                return result_rx;
            }
            if state.queue.len() >= self.limits.max_queue_size {
                drop(state);
                let _ = result_tx.send(Err(ResourceError::QueueFull));
                return result_rx;
            }

            state.next_seq += 1;
            let seq = state.next_seq;

            let manager = Arc::clone(self);
            let op_id = spec.id.clone();
            let folder = spec.folder.clone();
            let start: Box<dyn FnOnce(Option<ResourceError>) + Send> =
                Box::new(move |rejection| {
                    if let Some(error) = rejection {
                        let _ = result_tx.send(Err(error));
                        return;
                    }

                    tokio::spawn(async move {
                        let outcome = tokio::select! {
                            // The sender fires (or is dropped) when the
                            // operation is force-cancelled; either way the
                            // work stops here.
                            _ = cancel_rx => Err(ResourceError::ForcedShutdown),
                            output = work => Ok(output),
                        };

                        let cancelled = outcome.is_err();
                        if cancelled {
                            tracing::warn!(operation = op_id.as_str(), folder = folder.as_str(),
                                "operation cancelled by forced shutdown");
                        }
                        let _ = result_tx.send(outcome);
                        manager.finish_operation(seq, cancelled);
                    });
                });

            state.queue.push(QueuedOperation {
                seq,
                priority: spec.priority,
                estimated_memory_bytes: spec.estimated_memory_bytes,
                cancel_tx,
                start,
            });
        }

        self.try_dispatch();
        result_rx
    }

    /// Graceful shutdown waits for active operations; forced shutdown cancels
    /// them. Both stop further admissions and are idempotent.
    pub async fn shutdown(self: &Arc<Self>, force: bool) {
        let (queued, active) = {
            let mut state = self.state.lock().expect("resource manager mutex poisoned");
            state.shutting_down = true;

            // Queued work never starts once shutdown begins.
            let queued: Vec<QueuedOperation> = std::mem::take(&mut state.queue);

            if force {
                let active: Vec<ActiveOperation> = state.active.drain().map(|(_, op)| op).collect();
                state.active_memory = 0;
                (queued, active)
            } else {
                (queued, Vec::new())
            }
        };

        if force {
            self.drained.notify_waiters();
        }

        let rejection = if force {
            ResourceError::ForcedShutdown
        } else {
            ResourceError::ShuttingDown
        };
        for op in queued {
            (op.start)(Some(rejection));
        }
        for op in active {
            let _ = op.cancel_tx.send(());
        }

        if force {
            return;
        }

        loop {
            // Register for the wakeup before reading the count, otherwise a
            // completion landing in between is lost.
            let notified = self.drained.notified();
            let active_count = {
                let state = self.state.lock().expect("resource manager mutex poisoned");
                state.active.len()
            };
            if active_count == 0 {
                break;
            }

            tracing::info!(active = active_count, "waiting for active operations to finish");
            notified.await;
        }
    }

    fn finish_operation(self: &Arc<Self>, seq: u64, cancelled: bool) {
        {
            let mut state = self.state.lock().expect("resource manager mutex poisoned");
            if let Some(op) = state.active.remove(&seq) {
                state.active_memory = state.active_memory.saturating_sub(op.estimated_memory_bytes);
            }
            if cancelled {
                state.failed += 1;
            } else {
                state.completed += 1;
            }

            if state.active.is_empty() {
                self.drained.notify_waiters();
            }
        }

        self.try_dispatch();
    }

    /// Move queued operations into the active set while the budgets allow.
    fn try_dispatch(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().expect("resource manager mutex poisoned");
                if state.shutting_down {
                    return;
                }
                if state.active.len() >= self.limits.max_concurrent_operations {
                    return;
                }

                // Highest priority first, FIFO inside a band.
                let Some(best_index) = state
                    .queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, op)| (std::cmp::Reverse(op.priority), op.seq))
                    .map(|(index, _)| index)
                else {
                    return;
                };

                let candidate = &state.queue[best_index];
                let fits_memory = state.active.is_empty()
                    || state.active_memory + candidate.estimated_memory_bytes
                        <= self.limits.max_memory_bytes;
                if !fits_memory {
                    return;
                }

                let op = state.queue.remove(best_index);
                state.active_memory += op.estimated_memory_bytes;
                state.active.insert(
                    op.seq,
                    ActiveOperation {
                        estimated_memory_bytes: op.estimated_memory_bytes,
                        cancel_tx: op.cancel_tx,
                    },
                );
                op.start
            };

            next(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use super::{OperationSpec, ResourceError, ResourceLimits, ResourceManager};

    fn spec(id: &str, priority: u8) -> OperationSpec {
        OperationSpec {
            id: id.to_string(),
            folder: "/folder".to_string(),
            priority,
            estimated_memory_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn operations_run_and_report_stats() {
        let manager = ResourceManager::new(ResourceLimits::default());

        let rx = manager.submit(spec("op-1", 0), async { 41 + 1 });
        let result = rx.await.expect("channel should resolve");
        assert_eq!(result, Ok(42));

        // Completion is recorded once the spawned task finishes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = manager.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active_operations, 0);
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced() {
        let manager = ResourceManager::new(ResourceLimits {
            max_concurrent_operations: 2,
            ..ResourceLimits::default()
        });

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for index in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            receivers.push(manager.submit(spec(&format!("op-{index}"), 0), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for rx in receivers {
            rx.await.expect("channel should resolve").expect("operation should run");
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "no more than two operations at once");
    }

    #[tokio::test]
    async fn forced_shutdown_resolves_in_flight_operations_quickly() {
        let manager = ResourceManager::new(ResourceLimits::default());

        let rx = manager.submit(spec("long-op", 0), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        // Let the operation start before cancelling it.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        manager.shutdown(true).await;
        let result = rx.await.expect("channel should resolve");

        assert_eq!(result, Err(ResourceError::ForcedShutdown));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.stats().active_operations, 0);
    }

    #[tokio::test]
    async fn forced_shutdown_is_idempotent() {
        let manager = ResourceManager::new(ResourceLimits::default());
        let rx = manager.submit(spec("long-op", 0), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.shutdown(true).await;
        manager.shutdown(true).await;

        assert_eq!(
            rx.await.expect("channel should resolve"),
            Err(ResourceError::ForcedShutdown)
        );
        assert_eq!(manager.stats().active_operations, 0);
        assert_eq!(manager.stats().queued_operations, 0);
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_rejected() {
        let manager = ResourceManager::new(ResourceLimits::default());
        manager.shutdown(false).await;

        let rx = manager.submit(spec("late", 0), async {});
        assert_eq!(
            rx.await.expect("channel should resolve"),
            Err(ResourceError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn queue_overflow_is_rejected() {
        let manager = ResourceManager::new(ResourceLimits {
            max_concurrent_operations: 1,
            max_queue_size: 1,
            ..ResourceLimits::default()
        });

        // One running, one queued, the third overflows. Submission moves the
        // first operation out of the queue immediately, so the queue slot is
        // taken by the second.
        let _first = manager.submit(spec("first", 0), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _second = manager.submit(spec("second", 0), async {});
        let third = manager.submit(spec("third", 0), async {});

        assert_eq!(
            third.await.expect("channel should resolve"),
            Err(ResourceError::QueueFull)
        );

        manager.shutdown(true).await;
    }

    #[tokio::test]
    async fn higher_priority_overtakes_the_queue_but_not_running_work() {
        let manager = ResourceManager::new(ResourceLimits {
            max_concurrent_operations: 1,
            ..ResourceLimits::default()
        });

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let record = |label: &'static str| {
            let order = Arc::clone(&order);
            async move {
                order.lock().expect("order mutex").push(label);
            }
        };

        let blocker = manager.submit(spec("blocker", 0), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let low = manager.submit(spec("low", 0), record("low"));
        let high = manager.submit(spec("high", 5), record("high"));

        blocker.await.expect("channel").expect("blocker should finish");
        high.await.expect("channel").expect("high should finish");
        low.await.expect("channel").expect("low should finish");

        let order = order.lock().expect("order mutex").clone();
        assert_eq!(order, vec!["high", "low"]);
    }
}
