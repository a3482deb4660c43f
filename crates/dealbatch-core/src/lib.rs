//! dealbatch-core: Core library for dealbatch
//!
//! Coalesces fine-grained edits to a shared, partially persisted aggregate,
//! persists them in debounced single-flight batches, and reconciles the
//! server-confirmed results back onto local state.
//!
//! # Architecture
//!
//! ```text
//! add(key, entry) → Pending set ──debounce / flush──▶ prepare → Persister
//!                                                        ↓
//!                         Observers ◀── apply onto SharedAggregate
//! ```
//!
//! # Modules
//!
//! - `mutation`: Mutation descriptors, deferred producers and pending entries
//! - `reconcile`: Prepare (merge over previous state) and apply (write back results)
//! - `persist`: The caller-supplied persistence boundary and the shared aggregate
//! - `scheduler`: Debounce timer seam (tokio-backed and manual)
//! - `queue`: The batched, single-flight mutation queue
//! - `events`: Typed success/error observers
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation guidance
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod mutation;
pub mod persist;
pub mod queue;
pub mod reconcile;
pub mod scheduler;

pub use config::{DealbatchConfig, QueueConfig, load_config};
pub use error::{ConfigError, Error, PersistError, QueueError, Remediation, ResolveError, Result};
pub use events::{BatchFailure, BatchSuccess, EventKind, QueueEvent, Subscription};
pub use mutation::{
    DeferredDescriptor, Equivalence, MutationDescriptor, MutationKind, PendingEntry,
    PersistedMutation, SubmittedMutation, find_result,
};
pub use persist::{PersistFuture, Persister, SharedAggregate, persist_fn, shared};
pub use queue::{AddOutcome, FlushReport, MutationQueue, MutationQueueBuilder, QueueStats};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
