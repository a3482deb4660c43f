//! Debounce scheduling seam.
//!
//! The queue owns its timing policy through a [`Scheduler`]: one trailing,
//! resettable slot. Scheduling a task replaces (and cancels) whatever was
//! scheduled before.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::QueueError;

pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Single-slot delayed task runner.
///
/// Implementations must not run `task` synchronously from inside
/// `schedule`; the queue calls `schedule` while holding its state lock.
pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay`, replacing any previously scheduled task.
    fn schedule(&self, delay: Duration, task: ScheduledTask);

    /// Drop the scheduled task, if any.
    fn cancel(&self);
}

/// Timer backed by a sleeping tokio task.
#[derive(Debug)]
pub struct TokioScheduler {
    handle: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TokioScheduler {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            pending: Mutex::new(None),
        }
    }

    /// Scheduler bound to the runtime the caller is running on.
    pub fn current() -> Result<Self, QueueError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| QueueError::NoRuntime(err.to_string()))
    }

    fn replace(&self, next: Option<JoinHandle<()>>) {
        let previous = match self.pending.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        self.replace(Some(handle));
    }

    fn cancel(&self) {
        self.replace(None);
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.replace(None);
    }
}

/// Scheduler driven by hand; nothing runs until [`ManualScheduler::fire`].
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Option<(Duration, ScheduledTask)>>,
    scheduled: AtomicU64,
    cancelled: AtomicU64,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(Duration, ScheduledTask)>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot().is_some()
    }

    /// Delay requested by the currently scheduled task.
    #[must_use]
    pub fn pending_delay(&self) -> Option<Duration> {
        self.slot().as_ref().map(|(delay, _)| *delay)
    }

    /// Run the scheduled task now. Returns `false` when nothing was scheduled.
    pub fn fire(&self) -> bool {
        let task = self.slot().take();
        match task {
            Some((_, task)) => {
                task();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn schedule_count(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cancel_count(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending_delay", &self.pending_delay())
            .field("scheduled", &self.schedule_count())
            .field("cancelled", &self.cancel_count())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        *self.slot() = Some((delay, task));
    }

    fn cancel(&self) {
        if self.slot().take().is_some() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
}
