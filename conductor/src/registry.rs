use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::engine::RunId;

/// Wake-up handle owned by the worker performing a run.
///
/// Clones share state: interrupting any clone wakes every task waiting in
/// [`interrupted`](Self::interrupted). Interruption is sticky.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    inner: Arc<WorkerHandleInner>,
}

#[derive(Debug)]
struct WorkerHandleInner {
    interrupted: AtomicBool,
    notify: Notify,
}

impl WorkerHandle {
    /// Create a new, uninterrupted handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WorkerHandleInner {
                interrupted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Force the worker awake.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Wait until interrupted.
    pub async fn interrupted(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Enabled before the flag check so an interrupt racing with this
        // call cannot slip between the check and the wait.
        notified.as_mut().enable();
        if self.is_interrupted() {
            return;
        }
        notified.await;
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct CancellationEntry {
    stop_requested: bool,
    worker: Option<WorkerHandle>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<RunId, CancellationEntry>,
    retired: HashSet<RunId>,
    retired_order: VecDeque<RunId>,
}

/// Process-wide table of stop requests for in-flight runs.
///
/// Each entry pairs a sticky stop flag with the handle of the worker that
/// should be woken when the flag is set. Every operation runs under one lock,
/// so a registration and a concurrent stop request are totally ordered: either
/// the stop sees the handle and interrupts it, or the registration sees the
/// flag and reports it.
///
/// Cleared run ids are remembered (up to `retired_capacity`) so that a stop
/// request arriving after the worker finished does not resurrect an entry.
#[derive(Clone)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<RegistryState>>,
    retired_capacity: usize,
}

impl fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CancellationRegistry");
        match self.inner.try_lock() {
            Some(state) => {
                debug.field("entries", &state.entries.len());
                debug.field("retired", &state.retired.len());
            }
            None => {
                debug.field("entries", &"<locked>");
            }
        }
        debug.field("retired_capacity", &self.retired_capacity);
        debug.finish()
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl CancellationRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState::default())),
            retired_capacity: config.retired_capacity,
        }
    }

    /// Attach the worker handle for `run_id`.
    ///
    /// Returns whether a stop had already been requested. When it had, the
    /// handle is interrupted before this returns, so the worker's very first
    /// wait or check observes the stop.
    pub fn register(&self, run_id: RunId, handle: WorkerHandle) -> bool {
        let mut state = self.inner.lock();
        let entry = state.entries.entry(run_id).or_default();
        let stop_requested = entry.stop_requested;
        if stop_requested {
            handle.interrupt();
        }
        entry.worker = Some(handle);
        drop(state);

        debug!(run_id = %run_id, stop_requested, "worker registered");
        stop_requested
    }

    /// Request that `run_id` stop. Idempotent and infallible.
    ///
    /// Creates a flagged entry without a handle if the worker has not
    /// registered yet. Does nothing for runs already cleared.
    pub fn request_stop(&self, run_id: RunId) {
        let mut state = self.inner.lock();
        if state.retired.contains(&run_id) {
            drop(state);
            debug!(run_id = %run_id, "stop requested for finished run; ignoring");
            return;
        }

        let entry = state.entries.entry(run_id).or_default();
        let first = !entry.stop_requested;
        entry.stop_requested = true;
        let worker = entry.worker.clone();
        drop(state);

        match worker {
            Some(worker) => {
                worker.interrupt();
                if first {
                    info!(run_id = %run_id, "stop requested; worker interrupted");
                }
            }
            None if first => {
                info!(run_id = %run_id, "stop requested before worker registered");
            }
            None => {}
        }
    }

    /// Current stop flag for `run_id`; `false` when there is no entry.
    pub fn should_stop(&self, run_id: RunId) -> bool {
        self.inner
            .lock()
            .entries
            .get(&run_id)
            .map(|entry| entry.stop_requested)
            .unwrap_or(false)
    }

    /// Remove the entry for `run_id` and retire the id. Safe to repeat.
    pub fn clear(&self, run_id: RunId) {
        let mut state = self.inner.lock();
        let removed = state.entries.remove(&run_id).is_some();
        if state.retired.insert(run_id) {
            state.retired_order.push_back(run_id);
            while state.retired_order.len() > self.retired_capacity {
                if let Some(oldest) = state.retired_order.pop_front() {
                    state.retired.remove(&oldest);
                }
            }
        }
        drop(state);

        if removed {
            debug!(run_id = %run_id, "cancellation entry cleared");
        }
    }

    /// Run ids whose stop flag is set.
    pub fn list_flagged(&self) -> HashSet<RunId> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.stop_requested)
            .map(|(run_id, _)| *run_id)
            .collect()
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.inner.lock().entries.contains_key(&run_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
