//! Typed observers for queue outcomes.
//!
//! Each queue owns its own observer list; there is no global registry.
//! Handlers run synchronously on the dispatching task after the queue state
//! has been updated and outside any queue lock, so a handler may call back
//! into the queue (for example to `add` a follow-up edit). A panicking
//! handler is logged and skipped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::PersistError;
use crate::mutation::{MutationDescriptor, PersistedMutation, SubmittedMutation};

/// Event discriminant used when subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Success,
    Error,
}

/// A batch was persisted and applied to the aggregate.
#[derive(Debug, Clone)]
pub struct BatchSuccess {
    pub batch_id: u64,
    /// Pending-set keys of the submitted mutations, in submission order.
    pub keys: Vec<String>,
    pub results: Vec<PersistedMutation>,
}

/// A batch failed; the aggregate was left untouched.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub batch_id: u64,
    pub mutations: Vec<SubmittedMutation>,
    pub error: PersistError,
}

impl BatchFailure {
    /// Descriptors that were submitted, without their keys.
    #[must_use]
    pub fn descriptors(&self) -> Vec<MutationDescriptor> {
        self.mutations.iter().map(|m| m.descriptor.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Success(BatchSuccess),
    Error(BatchFailure),
}

impl QueueEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Success(_) => EventKind::Success,
            Self::Error(_) => EventKind::Error,
        }
    }

    #[must_use]
    pub fn batch_id(&self) -> u64 {
        match self {
            Self::Success(success) => success.batch_id,
            Self::Error(failure) => failure.batch_id,
        }
    }
}

pub(crate) type Handler = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

struct Registration {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration>>,
}

impl Observers {
    fn registrations(&self) -> MutexGuard<'_, Vec<Registration>> {
        match self.registrations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn register(self: &Arc<Self>, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations().push(Registration { id, kind, handler });
        Subscription {
            id,
            observers: Arc::downgrade(self),
            detached: false,
        }
    }

    fn remove(&self, id: u64) {
        self.registrations().retain(|registration| registration.id != id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.registrations().len()
    }

    /// Deliver `event` to every matching handler.
    pub(crate) fn emit(&self, event: &QueueEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .registrations()
            .iter()
            .filter(|registration| registration.kind.is_none_or(|k| k == kind))
            .map(|registration| Arc::clone(&registration.handler))
            .collect();
        for handler in handlers {
            let delivered = isolate("event handler", || handler(event));
            if delivered.is_none() {
                error!(batch_id = event.batch_id(), kind = ?kind, "Dropped event for panicking handler");
            }
        }
    }
}

/// Run caller-supplied code, turning a panic into `None`.
///
/// Dispatch state is already committed when callbacks run; unwinding out of
/// them would leave a waiting `flush` without its settlement.
pub(crate) fn isolate<R>(what: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(callback = what, panic = %message, "Caller callback panicked");
            None
        }
    }
}

/// Handle for a registered handler; dropping it unsubscribes.
#[must_use = "dropping a Subscription removes its handler"]
pub struct Subscription {
    id: u64,
    observers: Weak<Observers>,
    detached: bool,
}

impl Subscription {
    /// Remove the handler now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the handler registered for the lifetime of the queue.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(self.id);
        }
    }
}
