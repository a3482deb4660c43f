//! Batched mutation queue.
//!
//! [`MutationQueue`] buffers edits under caller-chosen keys (last write per
//! key wins), waits for a trailing debounce window, and then persists the
//! whole pending set as one batch. At most one batch is in flight per queue.
//! Edits arriving while a batch is in flight are buffered and dispatched as a
//! chained batch as soon as the current one succeeds, without waiting for the
//! debounce window again.
//!
//! State machine:
//!
//! ```text
//! Idle ──debounce / flush──▶ Dispatching ──ok──▶ Idle (chains if work is pending)
//!                                        └─err─▶ Idle (no retry)
//! ```
//!
//! Locking is an orthogonal flag checked only by [`MutationQueue::add`].
//!
//! Dispatches run on spawned tokio tasks so that dropping a `flush` future
//! never abandons a batch half way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, ResolveError};
use crate::events::{
    BatchFailure, BatchSuccess, EventKind, Observers, QueueEvent, Subscription, isolate,
};
use crate::mutation::{MutationDescriptor, PendingEntry, PersistedMutation, SubmittedMutation};
use crate::persist::{Persister, SharedAggregate, read_aggregate};
use crate::reconcile::{ReconcileOutcome, reconcile};
use crate::scheduler::{Scheduler, TokioScheduler};

/// Result of [`MutationQueue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    /// A new key entered the pending set.
    Queued,
    /// An existing pending entry under the same key was overwritten.
    Replaced,
    /// The queue is locked; nothing changed.
    Rejected,
}

/// What a [`MutationQueue::flush`] call observed while draining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Dispatches that settled while the flush was waiting.
    pub dispatches: u64,
    /// Mutations persisted by those dispatches.
    pub persisted: u64,
    /// Dispatches that had nothing left to submit after preparation.
    pub skipped: u64,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub dispatches: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub persisted_mutations: u64,
    pub rejected_adds: u64,
    pub coalesced_adds: u64,
    pub dropped_deferred: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    dispatches: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    persisted_mutations: AtomicU64,
    rejected_adds: AtomicU64,
    coalesced_adds: AtomicU64,
    dropped_deferred: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            persisted_mutations: self.persisted_mutations.load(Ordering::Relaxed),
            rejected_adds: self.rejected_adds.load(Ordering::Relaxed),
            coalesced_adds: self.coalesced_adds.load(Ordering::Relaxed),
            dropped_deferred: self.dropped_deferred.load(Ordering::Relaxed),
        }
    }
}

/// How a dispatch ended, as seen by waiting `flush` calls.
#[derive(Debug, Clone)]
enum Settlement {
    Persisted { mutations: usize },
    Skipped,
    Failed(Box<BatchFailure>),
}

impl FlushReport {
    fn record(&mut self, settlement: Settlement, first_failure: &mut Option<Box<BatchFailure>>) {
        self.dispatches += 1;
        match settlement {
            Settlement::Persisted { mutations } => self.persisted += mutations as u64,
            Settlement::Skipped => self.skipped += 1,
            Settlement::Failed(failure) => {
                if first_failure.is_none() {
                    *first_failure = Some(failure);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: IndexMap<String, PendingEntry>,
    saving: bool,
    /// Dispatches that gave up the in-flight slot but have not yet published
    /// their settlement (callbacks and events still running).
    settling: usize,
    locked: bool,
    /// Bumped on every debounce (re)arm and every dispatch; a timer callback
    /// only acts when its generation is still current.
    generation: u64,
    next_batch_id: u64,
}

/// Pending-set snapshot taken at dispatch time.
struct Batch {
    id: u64,
    entries: Vec<(String, PendingEntry)>,
}

/// Results of the dispatch a chained batch follows.
#[derive(Default)]
struct ChainContext {
    results: Vec<PersistedMutation>,
    descriptors: Vec<MutationDescriptor>,
}

struct QueueInner {
    config: QueueConfig,
    aggregate: SharedAggregate,
    persister: Arc<dyn Persister>,
    scheduler: Arc<dyn Scheduler>,
    runtime: Handle,
    state: Mutex<QueueState>,
    observers: Arc<Observers>,
    settlements: broadcast::Sender<Settlement>,
    stats: StatsCounters,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn arm_debounce(self: &Arc<Self>, state: &mut QueueState) {
        state.generation += 1;
        let generation = state.generation;
        let queue = Arc::downgrade(self);
        self.scheduler.schedule(
            self.config.debounce(),
            Box::new(move || {
                if let Some(inner) = queue.upgrade() {
                    inner.on_debounce_elapsed(generation);
                }
            }),
        );
    }

    fn on_debounce_elapsed(self: &Arc<Self>, generation: u64) {
        let batch = {
            let mut state = self.state();
            if state.generation != generation || state.saving || state.pending.is_empty() {
                return;
            }
            self.begin_dispatch(&mut state)
        };
        self.spawn_dispatch(batch);
    }

    /// Snapshot and clear the pending set and take the in-flight slot.
    fn begin_dispatch(&self, state: &mut QueueState) -> Batch {
        state.saving = true;
        state.generation += 1;
        state.next_batch_id += 1;
        self.scheduler.cancel();
        let entries: Vec<(String, PendingEntry)> = std::mem::take(&mut state.pending).into_iter().collect();
        StatsCounters::bump(&self.stats.dispatches, 1);
        debug!(
            queue = %self.config.name,
            batch_id = state.next_batch_id,
            mutations = entries.len(),
            "Dispatching batch"
        );
        Batch {
            id: state.next_batch_id,
            entries,
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, batch: Batch) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let mut next = Some((batch, ChainContext::default()));
            while let Some((batch, context)) = next.take() {
                next = inner.dispatch_once(batch, context).await;
            }
        });
    }

    /// Resolve deferred producers against the previous dispatch in the chain.
    fn resolve(&self, batch: Batch, context: &ChainContext) -> Vec<SubmittedMutation> {
        let mut submitted = Vec::with_capacity(batch.entries.len());
        for (key, entry) in batch.entries {
            let descriptor = match entry {
                PendingEntry::Ready(descriptor) => Ok(descriptor),
                PendingEntry::Deferred(producer) => isolate("deferred producer", || {
                    producer.resolve(&context.results, &context.descriptors)
                })
                .unwrap_or_else(|| Err(ResolveError::Failed("producer panicked".to_string()))),
            };
            match descriptor {
                Ok(descriptor) => submitted.push(SubmittedMutation { key, descriptor }),
                Err(err) => {
                    StatsCounters::bump(&self.stats.dropped_deferred, 1);
                    warn!(
                        queue = %self.config.name,
                        batch_id = batch.id,
                        key = %key,
                        error = %err,
                        "Dropping deferred mutation that failed to resolve"
                    );
                }
            }
        }
        submitted
    }

    /// Run one batch to completion; returns the chained batch, if any.
    async fn dispatch_once(
        self: &Arc<Self>,
        batch: Batch,
        context: ChainContext,
    ) -> Option<(Batch, ChainContext)> {
        let batch_id = batch.id;
        let submitted = self.resolve(batch, &context);
        drop(context);

        let outcome = if submitted.is_empty() {
            ReconcileOutcome::Skipped
        } else {
            reconcile(&self.aggregate, submitted, &*self.persister).await
        };

        match outcome {
            ReconcileOutcome::Skipped => {
                StatsCounters::bump(&self.stats.skipped, 1);
                debug!(queue = %self.config.name, batch_id, "Batch had nothing to submit");
                self.release(false);
                self.publish(Settlement::Skipped);
                None
            }
            ReconcileOutcome::Applied { submitted, results } => {
                let mutations = results.len();
                StatsCounters::bump(&self.stats.succeeded, 1);
                StatsCounters::bump(&self.stats.persisted_mutations, mutations as u64);
                let chained = self.release(true);
                debug!(
                    queue = %self.config.name,
                    batch_id,
                    mutations,
                    chained = chained.is_some(),
                    "Batch persisted"
                );

                let descriptors: Vec<MutationDescriptor> =
                    submitted.iter().map(|m| m.descriptor.clone()).collect();
                let keys = submitted.into_iter().map(|m| m.key).collect();
                self.observers.emit(&QueueEvent::Success(BatchSuccess {
                    batch_id,
                    keys,
                    results: results.clone(),
                }));
                self.publish(Settlement::Persisted { mutations });

                chained.map(|next| (next, ChainContext { results, descriptors }))
            }
            ReconcileOutcome::Failed { submitted, error } => {
                StatsCounters::bump(&self.stats.failed, 1);
                error!(
                    queue = %self.config.name,
                    batch_id,
                    mutations = submitted.len(),
                    error = %error,
                    "Batch persistence failed"
                );
                let failure = BatchFailure {
                    batch_id,
                    mutations: submitted,
                    error,
                };
                self.release(false);

                let descriptors = failure.descriptors();
                isolate("on_error", || self.persister.on_error(&descriptors, &failure.error));
                let settlement = Settlement::Failed(Box::new(failure.clone()));
                self.observers.emit(&QueueEvent::Error(failure));
                self.publish(settlement);
                None
            }
        }
    }

    /// Give up the in-flight slot and enter the settling phase.
    ///
    /// With `chain`, leftover entries are dispatched at once and the new batch
    /// is returned; otherwise they wait for a fresh debounce window. Every
    /// call must be followed by [`Self::publish`] once callbacks and events
    /// have run.
    fn release(self: &Arc<Self>, chain: bool) -> Option<Batch> {
        let mut state = self.state();
        state.saving = false;
        state.settling += 1;
        if state.pending.is_empty() {
            None
        } else if chain {
            Some(self.begin_dispatch(&mut state))
        } else {
            self.arm_debounce(&mut state);
            None
        }
    }

    /// Leave the settling phase and wake waiting flushes.
    ///
    /// The send happens under the state lock, so a flush that observes the
    /// queue idle and not settling has already been sent every settlement
    /// that led there.
    fn publish(&self, settlement: Settlement) {
        let mut state = self.state();
        state.settling = state.settling.saturating_sub(1);
        // No receivers just means nobody is flushing.
        let _ = self.settlements.send(settlement);
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.scheduler.cancel();
    }
}

/// Builder for [`MutationQueue`].
pub struct MutationQueueBuilder {
    aggregate: SharedAggregate,
    persister: Arc<dyn Persister>,
    config: QueueConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl MutationQueueBuilder {
    #[must_use]
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default tokio-backed debounce timer.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Build the queue on the current tokio runtime.
    pub fn build(self) -> Result<MutationQueue, QueueError> {
        let runtime = Handle::try_current().map_err(|err| QueueError::NoRuntime(err.to_string()))?;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::new(runtime.clone())),
        };
        let (settlements, _) = broadcast::channel(self.config.settle_capacity.max(1));
        debug!(
            queue = %self.config.name,
            debounce_ms = self.config.debounce_ms,
            "Mutation queue created"
        );
        Ok(MutationQueue {
            inner: Arc::new(QueueInner {
                config: self.config,
                aggregate: self.aggregate,
                persister: self.persister,
                scheduler,
                runtime,
                state: Mutex::new(QueueState::default()),
                observers: Arc::new(Observers::default()),
                settlements,
                stats: StatsCounters::default(),
            }),
        })
    }
}

/// Debounced, single-flight mutation queue over one shared aggregate.
///
/// Cloning yields another handle to the same queue. Dropping the last handle
/// cancels a scheduled debounce; a batch already in flight still completes.
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    pub fn builder<P: Persister>(aggregate: SharedAggregate, persister: P) -> MutationQueueBuilder {
        MutationQueueBuilder {
            aggregate,
            persister: Arc::new(persister),
            config: QueueConfig::default(),
            scheduler: None,
        }
    }

    /// Queue with default configuration on the current runtime.
    pub fn new<P: Persister>(aggregate: SharedAggregate, persister: P) -> Result<Self, QueueError> {
        Self::builder(aggregate, persister).build()
    }

    /// Insert or overwrite the pending entry under `key`.
    ///
    /// Never blocks and never fails. While locked the edit is dropped with a
    /// warning. While idle the debounce window restarts; while a batch is in
    /// flight the entry simply waits for the next batch.
    pub fn add(&self, key: impl Into<String>, entry: impl Into<PendingEntry>) -> AddOutcome {
        let key = key.into();
        let inner = &self.inner;
        let mut state = inner.state();
        if state.locked {
            drop(state);
            StatsCounters::bump(&inner.stats.rejected_adds, 1);
            warn!(queue = %inner.config.name, key = %key, "Rejected mutation: queue is locked");
            return AddOutcome::Rejected;
        }

        let outcome = match state.pending.insert(key, entry.into()) {
            Some(_) => {
                StatsCounters::bump(&inner.stats.coalesced_adds, 1);
                AddOutcome::Replaced
            }
            None => AddOutcome::Queued,
        };
        if !state.saving {
            inner.arm_debounce(&mut state);
        }
        outcome
    }

    /// Drain the queue.
    ///
    /// Dispatches pending work immediately (cancelling the debounce) and waits
    /// until the queue is idle with an empty pending set. Chained dispatches
    /// are waited for too, and every awaited dispatch has run `on_error` and
    /// its observers before the flush returns. With `lock`, the queue is locked before anything is
    /// dispatched and stays locked until [`MutationQueue::unlock`].
    ///
    /// Returns the first failure observed, after draining everything else.
    pub async fn flush(&self, lock: bool) -> Result<FlushReport, QueueError> {
        let inner = &self.inner;
        let mut settlements = inner.settlements.subscribe();
        let mut report = FlushReport::default();
        let mut first_failure: Option<Box<BatchFailure>> = None;

        if lock {
            inner.state().locked = true;
            debug!(queue = %inner.config.name, "Queue locked for flush");
        }

        loop {
            let batch = {
                let mut state = inner.state();
                if state.saving || state.settling > 0 {
                    None
                } else if state.pending.is_empty() {
                    break;
                } else {
                    Some(inner.begin_dispatch(&mut state))
                }
            };
            if let Some(batch) = batch {
                inner.spawn_dispatch(batch);
            }

            match settlements.recv().await {
                Ok(settlement) => report.record(settlement, &mut first_failure),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(queue = %inner.config.name, missed, "Flush lagged behind dispatch outcomes");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        // Chained dispatches may have settled before this task looked again.
        while let Ok(settlement) = settlements.try_recv() {
            report.record(settlement, &mut first_failure);
        }

        match first_failure {
            Some(failure) => Err(QueueError::Persist(failure)),
            None => Ok(report),
        }
    }

    /// Accept new edits again. Buffered and in-flight work is unaffected.
    pub fn unlock(&self) {
        self.inner.state().locked = false;
        debug!(queue = %self.inner.config.name, "Queue unlocked");
    }

    /// Re-add the mutations of a failed batch under their original keys.
    ///
    /// Keys that already hold a newer pending entry are skipped. Returns the
    /// number of mutations re-added; zero while the queue is locked.
    pub fn requeue(&self, failure: &BatchFailure) -> usize {
        let inner = &self.inner;
        let mut state = inner.state();
        if state.locked {
            drop(state);
            StatsCounters::bump(&inner.stats.rejected_adds, failure.mutations.len() as u64);
            warn!(
                queue = %inner.config.name,
                batch_id = failure.batch_id,
                mutations = failure.mutations.len(),
                "Rejected requeue: queue is locked"
            );
            return 0;
        }

        let mut requeued = 0;
        for mutation in &failure.mutations {
            if state.pending.contains_key(&mutation.key) {
                continue;
            }
            state
                .pending
                .insert(mutation.key.clone(), PendingEntry::Ready(mutation.descriptor.clone()));
            requeued += 1;
        }
        if requeued > 0 && !state.saving {
            inner.arm_debounce(&mut state);
        }
        debug!(
            queue = %inner.config.name,
            batch_id = failure.batch_id,
            requeued,
            "Requeued failed mutations"
        );
        requeued
    }

    /// The pending set is non-empty.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        !self.inner.state().pending.is_empty()
    }

    /// A dispatch is in flight.
    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.inner.state().saving
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.state().locked
    }

    /// Pending keys in insertion order.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        self.inner.state().pending.keys().cloned().collect()
    }

    /// Register `handler` for one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&QueueEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.observers.register(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every event.
    pub fn subscribe_all(&self, handler: impl Fn(&QueueEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.register(None, Arc::new(handler))
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.inner.stats.snapshot()
    }

    /// Handle to the shared aggregate.
    #[must_use]
    pub fn aggregate(&self) -> SharedAggregate {
        Arc::clone(&self.inner.aggregate)
    }

    /// Copy of the current aggregate.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        read_aggregate(&self.inner.aggregate).clone()
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("MutationQueue")
            .field("name", &self.inner.config.name)
            .field("pending", &state.pending.len())
            .field("saving", &state.saving)
            .field("locked", &state.locked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;
    use crate::mutation::{DeferredDescriptor, Equivalence, MutationKind, find_result};
    use crate::persist::{PersistFuture, shared};
    use crate::scheduler::ManualScheduler;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;

    // ========================================================================
    // Test backend
    // ========================================================================

    #[derive(Default)]
    struct BackendState {
        calls: Mutex<Vec<Vec<MutationDescriptor>>>,
        failing_calls: Mutex<HashSet<usize>>,
        hold_first: Mutex<Option<Arc<Notify>>>,
        on_error_calls: AtomicUsize,
        applied: AtomicUsize,
        next_id: AtomicU64,
    }

    #[derive(Clone, Default)]
    struct Backend {
        state: Arc<BackendState>,
    }

    impl Backend {
        fn failing(calls: &[usize]) -> Self {
            let backend = Self::default();
            backend.state.failing_calls.lock().unwrap().extend(calls.iter().copied());
            backend
        }

        /// Hold the first persist call until the returned gate is notified.
        fn hold_first(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.state.hold_first.lock().unwrap() = Some(Arc::clone(&gate));
            gate
        }

        fn calls(&self) -> Vec<Vec<MutationDescriptor>> {
            self.state.calls.lock().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.state.calls.lock().unwrap().len()
        }

        async fn wait_for_calls(&self, count: usize) {
            while self.call_count() < count {
                tokio::task::yield_now().await;
            }
        }
    }

    impl Persister for Backend {
        fn persist(&self, _aggregate: Value, mutations: Vec<MutationDescriptor>) -> PersistFuture {
            let index = {
                let mut calls = self.state.calls.lock().unwrap();
                calls.push(mutations.clone());
                calls.len() - 1
            };
            let fail = self.state.failing_calls.lock().unwrap().contains(&index);
            let gate = if index == 0 {
                self.state.hold_first.lock().unwrap().clone()
            } else {
                None
            };
            let state = Arc::clone(&self.state);
            Box::pin(async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                if fail {
                    return Err(PersistError::Transport(format!("call {index} refused")));
                }
                Ok(mutations
                    .into_iter()
                    .map(|descriptor| {
                        let result = match descriptor.kind() {
                            MutationKind::Scalar => descriptor.payload().clone(),
                            _ if descriptor.is_removal() => Value::Null,
                            _ if descriptor.payload().get("id").is_some() => json!({}),
                            _ => json!({"id": state.next_id.fetch_add(1, Ordering::SeqCst) + 1}),
                        };
                        PersistedMutation::new(descriptor, result)
                    })
                    .collect())
            })
        }

        fn on_error(&self, _failed: &[MutationDescriptor], _error: &PersistError) {
            self.state.on_error_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn on_applied(&self, _aggregate: &Value) {
            self.state.applied.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rows() -> Equivalence {
        Equivalence::by_any_field(["id", "clientId"])
    }

    fn manual_queue(aggregate: Value, backend: &Backend) -> (MutationQueue, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let queue = MutationQueue::builder(shared(aggregate), backend.clone())
            .scheduler(Arc::clone(&scheduler) as Arc<dyn Scheduler>)
            .build()
            .unwrap();
        (queue, scheduler)
    }

    // ========================================================================
    // add / debounce
    // ========================================================================

    #[tokio::test]
    async fn add_arms_debounce_and_reports_coalescing() {
        let backend = Backend::default();
        let (queue, scheduler) = manual_queue(json!({}), &backend);

        assert_eq!(queue.add("title", MutationDescriptor::scalar("title", json!("a"))), AddOutcome::Queued);
        assert_eq!(scheduler.pending_delay(), Some(Duration::from_millis(300)));
        assert_eq!(
            queue.add("title", MutationDescriptor::scalar("title", json!("b"))),
            AddOutcome::Replaced
        );
        assert_eq!(scheduler.schedule_count(), 2);
        assert!(queue.is_queued());
        assert!(!queue.is_saving());
        assert_eq!(queue.pending_keys(), vec!["title".to_string()]);
        assert_eq!(queue.stats().coalesced_adds, 1);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn debounce_expiry_dispatches_last_write_per_key() {
        let backend = Backend::default();
        let (queue, scheduler) = manual_queue(json!({"title": "old"}), &backend);
        queue.add("title", MutationDescriptor::scalar("title", json!("first")));
        queue.add("title", MutationDescriptor::scalar("title", json!("second")));

        assert!(scheduler.fire());
        assert!(queue.is_saving());
        assert!(!queue.is_queued());
        queue.flush(false).await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].payload(), &json!("second"));
        assert_eq!(queue.snapshot()["title"], "second");
        assert_eq!(backend.state.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_timer_after_flush_is_ignored() {
        let backend = Backend::default();
        let (queue, scheduler) = manual_queue(json!({}), &backend);
        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        queue.flush(false).await.unwrap();
        assert_eq!(scheduler.cancel_count(), 1);
        assert!(!scheduler.fire());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_debounce_is_trailing() {
        let backend = Backend::default();
        let queue = MutationQueue::new(shared(json!({})), backend.clone()).unwrap();

        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.add("b", MutationDescriptor::scalar("b", json!(2)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.call_count(), 0, "second add restarted the window");

        tokio::time::sleep(Duration::from_millis(150)).await;
        backend.wait_for_calls(1).await;
        queue.flush(false).await.unwrap();
        assert_eq!(backend.calls()[0].len(), 2);
    }

    // ========================================================================
    // single flight / chaining
    // ========================================================================

    #[tokio::test]
    async fn adds_during_flight_chain_without_debounce() {
        let backend = Backend::default();
        let gate = backend.hold_first();
        let (queue, scheduler) = manual_queue(json!({}), &backend);

        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        scheduler.fire();
        backend.wait_for_calls(1).await;

        queue.add("b", MutationDescriptor::scalar("b", json!(2)));
        queue.add("c", MutationDescriptor::scalar("c", json!(3)));
        assert!(queue.is_saving());
        assert!(queue.is_queued());
        assert!(!scheduler.is_pending(), "adds while saving do not arm the timer");
        assert_eq!(backend.call_count(), 1);

        gate.notify_one();
        let report = queue.flush(false).await.unwrap();
        assert_eq!(report.dispatches, 2);
        assert_eq!(report.persisted, 3);

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        let second: Vec<&str> = calls[1].iter().map(MutationDescriptor::property).collect();
        assert_eq!(second, vec!["b", "c"]);
        assert_eq!(scheduler.schedule_count(), 1);
        assert_eq!(queue.snapshot(), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[tokio::test]
    async fn deferred_producer_sees_previous_batch() {
        let backend = Backend::default();
        let gate = backend.hold_first();
        let (queue, scheduler) = manual_queue(json!({"tickets": []}), &backend);

        queue.add(
            "tickets:r1",
            MutationDescriptor::collection("tickets", json!({"clientId": "r1", "price": 5}), rows()),
        );
        scheduler.fire();
        backend.wait_for_calls(1).await;

        queue.add(
            "tickets:r1:price",
            DeferredDescriptor::new(|results, descriptors| {
                assert_eq!(descriptors.len(), 1);
                let row = find_result(results, "tickets", &json!({"clientId": "r1"}))
                    .ok_or_else(|| ResolveError::MissingResult("tickets:r1".to_string()))?;
                Ok(MutationDescriptor::collection(
                    "tickets",
                    json!({"id": row.result["id"], "price": 9}),
                    rows(),
                ))
            }),
        );
        gate.notify_one();
        queue.flush(false).await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls[1][0].payload(), &json!({"id": 1, "clientId": "r1", "price": 9}));
        assert_eq!(queue.snapshot()["tickets"], json!([{"clientId": "r1", "price": 9, "id": 1}]));
    }

    #[tokio::test]
    async fn failing_producers_are_dropped_and_rest_proceeds() {
        let backend = Backend::default();
        let (queue, _scheduler) = manual_queue(json!({}), &backend);

        queue.add(
            "needs-previous",
            DeferredDescriptor::new(|results, _| {
                results
                    .first()
                    .map(|r| MutationDescriptor::scalar("x", r.result.clone()))
                    .ok_or_else(|| ResolveError::MissingResult("x".to_string()))
            }),
        );
        queue.add(
            "panics",
            DeferredDescriptor::new(|_, _| panic!("producer bug")),
        );
        queue.add("title", MutationDescriptor::scalar("title", json!("kept")));

        let report = queue.flush(false).await.unwrap();
        assert_eq!(report.persisted, 1);
        assert_eq!(backend.calls()[0].len(), 1);
        assert_eq!(queue.stats().dropped_deferred, 2);
    }

    // ========================================================================
    // failures
    // ========================================================================

    #[tokio::test]
    async fn failure_leaves_aggregate_and_does_not_retry() {
        let backend = Backend::failing(&[0]);
        let (queue, scheduler) = manual_queue(json!({"notes": "keep"}), &backend);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = queue.subscribe(EventKind::Error, move |event| {
            sink.lock().unwrap().push(event.batch_id());
        });

        queue.add("notes", MutationDescriptor::remove_scalar("notes"));
        let err = queue.flush(false).await.unwrap_err();
        let failure = err.failure().unwrap();
        assert_eq!(failure.mutations.len(), 1);
        assert_eq!(failure.mutations[0].key, "notes");
        assert!(matches!(failure.error, PersistError::Transport(_)));

        assert_eq!(queue.snapshot(), json!({"notes": "keep"}));
        assert!(!queue.is_saving());
        assert!(!queue.is_queued());
        assert!(!scheduler.is_pending());
        assert_eq!(backend.state.on_error_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*events.lock().unwrap(), vec![1]);
        assert_eq!(queue.stats().failed, 1);

        tokio::task::yield_now().await;
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn edits_buffered_during_failed_flight_rearm_debounce() {
        let backend = Backend::failing(&[0]);
        let gate = backend.hold_first();
        let (queue, scheduler) = manual_queue(json!({}), &backend);

        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        scheduler.fire();
        backend.wait_for_calls(1).await;
        queue.add("b", MutationDescriptor::scalar("b", json!(2)));
        assert!(!scheduler.is_pending());

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let _sub = queue.subscribe(EventKind::Error, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        gate.notify_one();
        while errors.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!queue.is_saving());
        assert_eq!(queue.pending_keys(), vec!["b".to_string()]);
        assert!(scheduler.is_pending());
        scheduler.fire();
        queue.flush(false).await.unwrap();
        assert_eq!(backend.calls()[1][0].property(), "b");
        assert!(queue.snapshot().get("a").is_none());
    }

    /// Persister whose callbacks run slowly on the dispatching task.
    struct SlowCallbacks {
        fail: bool,
        reported: Arc<AtomicBool>,
    }

    impl Persister for SlowCallbacks {
        fn persist(&self, _aggregate: Value, mutations: Vec<MutationDescriptor>) -> PersistFuture {
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(PersistError::Rejected("always".to_string()));
                }
                Ok(mutations
                    .into_iter()
                    .map(|d| {
                        let result = d.payload().clone();
                        PersistedMutation::new(d, result)
                    })
                    .collect())
            })
        }

        fn on_error(&self, _failed: &[MutationDescriptor], _error: &PersistError) {
            std::thread::sleep(Duration::from_millis(100));
            self.reported.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn flush_rejects_only_after_error_callbacks_ran() {
        for _ in 0..3 {
            let reported = Arc::new(AtomicBool::new(false));
            let persister = SlowCallbacks {
                fail: true,
                reported: Arc::clone(&reported),
            };
            let queue = MutationQueue::new(shared(json!({})), persister).unwrap();
            let events = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&events);
            queue
                .subscribe(EventKind::Error, move |_| {
                    std::thread::sleep(Duration::from_millis(50));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .detach();

            queue.add("title", MutationDescriptor::scalar("title", json!("x")));
            let err = queue.flush(false).await.unwrap_err();
            assert!(matches!(err, QueueError::Persist(_)));
            assert!(reported.load(Ordering::SeqCst), "on_error ran before flush returned");
            assert_eq!(events.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn flush_resolves_only_after_success_observers_ran() {
        for _ in 0..3 {
            let persister = SlowCallbacks {
                fail: false,
                reported: Arc::new(AtomicBool::new(false)),
            };
            let queue = MutationQueue::new(shared(json!({})), persister).unwrap();
            let events = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&events);
            queue
                .subscribe(EventKind::Success, move |_| {
                    std::thread::sleep(Duration::from_millis(100));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .detach();

            queue.add("title", MutationDescriptor::scalar("title", json!("x")));
            let report = queue.flush(false).await.unwrap();
            assert_eq!(report.persisted, 1);
            assert_eq!(events.load(Ordering::SeqCst), 1);
            assert!(!queue.is_saving());
        }
    }

    #[tokio::test]
    async fn flush_keeps_draining_after_failure() {
        let backend = Backend::failing(&[0]);
        let gate = backend.hold_first();
        let (queue, scheduler) = manual_queue(json!({}), &backend);

        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        scheduler.fire();
        backend.wait_for_calls(1).await;
        queue.add("b", MutationDescriptor::scalar("b", json!(2)));
        gate.notify_one();

        let err = queue.flush(false).await.unwrap_err();
        assert_eq!(err.failure().unwrap().batch_id, 1);
        assert_eq!(backend.call_count(), 2);
        assert_eq!(queue.snapshot(), json!({"b": 2}));
        assert!(!queue.is_queued());
    }

    #[tokio::test]
    async fn requeue_skips_keys_with_newer_entries() {
        let backend = Backend::failing(&[0]);
        let (queue, _scheduler) = manual_queue(json!({}), &backend);
        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        queue.add("b", MutationDescriptor::scalar("b", json!(1)));
        let err = queue.flush(false).await.unwrap_err();

        queue.add("b", MutationDescriptor::scalar("b", json!(2)));
        assert_eq!(queue.requeue(err.failure().unwrap()), 1);
        queue.flush(false).await.unwrap();
        assert_eq!(queue.snapshot(), json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn panicking_on_error_does_not_wedge_queue() {
        struct Grumpy;
        impl Persister for Grumpy {
            fn persist(&self, _aggregate: Value, _mutations: Vec<MutationDescriptor>) -> PersistFuture {
                Box::pin(async { Err(PersistError::Rejected("no".to_string())) })
            }

            fn on_error(&self, _failed: &[MutationDescriptor], _error: &PersistError) {
                panic!("on_error bug");
            }
        }

        let queue = MutationQueue::builder(shared(json!({})), Grumpy)
            .scheduler(Arc::new(ManualScheduler::new()))
            .build()
            .unwrap();
        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        assert!(queue.flush(false).await.is_err());
        assert!(!queue.is_saving());
    }

    // ========================================================================
    // flush / lock
    // ========================================================================

    #[tokio::test]
    async fn flush_on_idle_empty_queue_resolves_immediately() {
        let backend = Backend::default();
        let (queue, _scheduler) = manual_queue(json!({}), &backend);
        assert_eq!(queue.flush(false).await.unwrap(), FlushReport::default());
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn flush_lock_rejects_adds_until_unlock() {
        let backend = Backend::default();
        let (queue, scheduler) = manual_queue(json!({}), &backend);
        queue.add("a", MutationDescriptor::scalar("a", json!(1)));

        let report = queue.flush(true).await.unwrap();
        assert_eq!(report.dispatches, 1);
        assert!(queue.is_locked());
        assert_eq!(queue.add("b", MutationDescriptor::scalar("b", json!(2))), AddOutcome::Rejected);
        assert!(!queue.is_queued());
        assert!(!scheduler.is_pending());
        assert_eq!(queue.stats().rejected_adds, 1);

        queue.unlock();
        assert_eq!(queue.add("b", MutationDescriptor::scalar("b", json!(2))), AddOutcome::Queued);
        assert!(queue.is_queued());
    }

    #[tokio::test]
    async fn lock_applies_before_dispatch_and_requeue_is_rejected() {
        let backend = Backend::failing(&[0]);
        let (queue, _scheduler) = manual_queue(json!({}), &backend);
        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        let err = queue.flush(true).await.unwrap_err();
        assert_eq!(queue.requeue(err.failure().unwrap()), 0);
        assert!(!queue.is_queued());
    }

    #[tokio::test]
    async fn delete_of_unpersisted_row_is_a_skipped_dispatch() {
        let backend = Backend::default();
        let (queue, _scheduler) = manual_queue(json!({"tickets": []}), &backend);
        let successes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&successes);
        let _sub = queue.subscribe_all(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        queue.add(
            "tickets:r9",
            MutationDescriptor::remove_element("tickets", json!({"clientId": "r9"}), rows()),
        );
        let report = queue.flush(false).await.unwrap();
        assert_eq!(report, FlushReport { dispatches: 1, persisted: 0, skipped: 1 });
        assert_eq!(backend.call_count(), 0);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().skipped, 1);
    }

    // ========================================================================
    // observers / lifecycle
    // ========================================================================

    #[tokio::test]
    async fn success_event_carries_keys_and_results() {
        let backend = Backend::default();
        let (queue, _scheduler) = manual_queue(json!({}), &backend);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let _sub = queue.subscribe(EventKind::Success, move |event| {
            if let QueueEvent::Success(success) = event {
                *sink.lock().unwrap() = Some(success.clone());
            }
        });

        queue.add("venue", MutationDescriptor::relation("venue", json!({"name": "Hall"})));
        queue.flush(false).await.unwrap();

        let success = seen.lock().unwrap().clone().unwrap();
        assert_eq!(success.batch_id, 1);
        assert_eq!(success.keys, vec!["venue".to_string()]);
        assert_eq!(success.results[0].result, json!({"id": 1}));
        assert_eq!(queue.snapshot()["venue"], json!({"name": "Hall", "id": 1}));
    }

    #[tokio::test]
    async fn handler_may_add_follow_up_edit() {
        let backend = Backend::default();
        let (queue, scheduler) = manual_queue(json!({}), &backend);
        let follow_up = queue.clone();
        let _sub = queue.subscribe(EventKind::Success, move |event| {
            if event.batch_id() == 1 {
                follow_up.add("audit", MutationDescriptor::scalar("audit", json!(true)));
            }
        });

        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        let report = queue.flush(false).await.unwrap();
        assert_eq!(report.dispatches, 2, "flush drains edits added by handlers");
        assert!(!queue.is_queued());
        assert!(!scheduler.is_pending());
        assert_eq!(queue.snapshot(), json!({"a": 1, "audit": true}));
    }

    #[tokio::test]
    async fn dropping_last_handle_cancels_debounce() {
        let backend = Backend::default();
        let (queue, scheduler) = manual_queue(json!({}), &backend);
        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        assert!(scheduler.is_pending());
        drop(queue);
        assert!(!scheduler.is_pending());
        assert!(!scheduler.fire());
    }

    #[test]
    fn build_outside_runtime_fails() {
        let err = MutationQueue::builder(shared(json!({})), Backend::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, QueueError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn stats_serialize_to_json() {
        let backend = Backend::default();
        let (queue, _scheduler) = manual_queue(json!({}), &backend);
        queue.add("a", MutationDescriptor::scalar("a", json!(1)));
        queue.flush(false).await.unwrap();
        let stats = serde_json::to_value(queue.stats()).unwrap();
        assert_eq!(stats["dispatches"], 1);
        assert_eq!(stats["succeeded"], 1);
        assert_eq!(stats["persisted_mutations"], 1);
        assert!(format!("{queue:?}").contains("MutationQueue"));
    }
}
