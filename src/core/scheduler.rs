//! Refresh Scheduler
//!
//! Cancellable delayed tasks addressed by handle. The token lifecycle
//! manager keeps at most one handle alive at a time.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Handle identifying a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleHandle(u64);

impl ScheduleHandle {
    /// Raw identifier.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Deferred unit of work.
pub type ScheduledTask = BoxFuture<'static, ()>;

/// Scheduler interface.
pub trait RefreshScheduler: Send + Sync {
    /// Run `task` after `delay`.
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle;

    /// Cancel a pending task. Returns false if it already ran or was unknown.
    fn cancel(&self, handle: ScheduleHandle) -> bool;

    /// Number of tasks waiting to fire.
    fn pending(&self) -> usize;
}

/// Scheduler backed by spawned tokio tasks.
#[derive(Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioScheduler {
    /// Create new tokio scheduler.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefreshScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = ScheduleHandle(id);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(delay_ms = delay.as_millis() as u64, "No tokio runtime, task not scheduled");
                return handle;
            }
        };

        // Hold the lock across spawn so the task cannot deregister before it is registered.
        let mut tasks = self.tasks.lock();
        let registry = Arc::clone(&self.tasks);
        let join = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Deregister first: once running, the task can no longer be cancelled.
            registry.lock().remove(&id);
            task.await;
        });
        tasks.insert(id, join.abort_handle());

        debug!(handle = id, delay_ms = delay.as_millis() as u64, "Task scheduled");
        handle
    }

    fn cancel(&self, handle: ScheduleHandle) -> bool {
        match self.tasks.lock().remove(&handle.0) {
            Some(abort) => {
                abort.abort();
                debug!(handle = handle.0, "Scheduled task cancelled");
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

struct ManualEntry {
    id: u64,
    delay: Duration,
    task: ScheduledTask,
}

/// Scheduler that only runs tasks when told to, for testing.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    entries: Mutex<Vec<ManualEntry>>,
    cancelled: AtomicU64,
}

impl ManualScheduler {
    /// Create new manual scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the pending tasks, in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.entries.lock().iter().map(|e| e.delay).collect()
    }

    /// Number of cancellations performed.
    pub fn cancelled_count(&self) -> u64 {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run every pending task now. Tasks scheduled while running stay pending.
    pub async fn run_pending(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries.lock());
        let count = entries.len();
        for entry in entries {
            entry.task.await;
        }
        count
    }
}

impl RefreshScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push(ManualEntry { id, delay, task });
        ScheduleHandle(id)
    }

    fn cancel(&self, handle: ScheduleHandle) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != handle.0);
        let removed = entries.len() != before;
        if removed {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    fn pending(&self) -> usize {
        self.entries.lock().len()
    }
}
