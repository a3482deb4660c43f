//! Persistence boundary and the shared aggregate handle.
//!
//! The queue never talks to a transport itself. Callers implement
//! [`Persister`] over whatever GraphQL client, HTTP batcher or cache they
//! use; the queue only requires one [`PersistedMutation`] back per submitted
//! descriptor.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::error::PersistError;
use crate::mutation::{MutationDescriptor, PersistedMutation};

/// Best-known merged state, owned by the caller and mutated in place only
/// after a successful dispatch.
pub type SharedAggregate = Arc<RwLock<Value>>;

/// Wrap an aggregate value for sharing with a queue.
#[must_use]
pub fn shared(aggregate: Value) -> SharedAggregate {
    Arc::new(RwLock::new(aggregate))
}

pub(crate) fn read_aggregate(aggregate: &SharedAggregate) -> RwLockReadGuard<'_, Value> {
    match aggregate.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_aggregate(aggregate: &SharedAggregate) -> RwLockWriteGuard<'_, Value> {
    match aggregate.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub type PersistFuture =
    Pin<Box<dyn Future<Output = Result<Vec<PersistedMutation>, PersistError>> + Send + 'static>>;

/// Caller-supplied persistence collaborator.
pub trait Persister: Send + Sync + 'static {
    /// Persist one prepared batch.
    ///
    /// `aggregate` is a snapshot taken when the batch was prepared. The
    /// returned results must pair 1:1 with `mutations`.
    fn persist(&self, aggregate: Value, mutations: Vec<MutationDescriptor>) -> PersistFuture;

    /// Called once per failed dispatch with every descriptor that was submitted.
    fn on_error(&self, _failed: &[MutationDescriptor], _error: &PersistError) {}

    /// Called after a successful batch has been applied to the aggregate.
    fn on_applied(&self, _aggregate: &Value) {}
}

impl<P: Persister + ?Sized> Persister for Arc<P> {
    fn persist(&self, aggregate: Value, mutations: Vec<MutationDescriptor>) -> PersistFuture {
        (**self).persist(aggregate, mutations)
    }

    fn on_error(&self, failed: &[MutationDescriptor], error: &PersistError) {
        (**self).on_error(failed, error);
    }

    fn on_applied(&self, aggregate: &Value) {
        (**self).on_applied(aggregate);
    }
}

/// Adapter turning an async closure into a [`Persister`].
pub struct FnPersister<F> {
    persist: F,
}

impl<F, Fut> Persister for FnPersister<F>
where
    F: Fn(Value, Vec<MutationDescriptor>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<PersistedMutation>, PersistError>> + Send + 'static,
{
    fn persist(&self, aggregate: Value, mutations: Vec<MutationDescriptor>) -> PersistFuture {
        Box::pin((self.persist)(aggregate, mutations))
    }
}

/// Build a [`Persister`] from an async closure.
pub fn persist_fn<F, Fut>(persist: F) -> FnPersister<F>
where
    F: Fn(Value, Vec<MutationDescriptor>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<PersistedMutation>, PersistError>> + Send + 'static,
{
    FnPersister { persist }
}
