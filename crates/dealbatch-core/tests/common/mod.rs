//! Shared test infrastructure for dealbatch-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::SimulatedBackend;
//! ```

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dealbatch_core::{
    Equivalence, MutationDescriptor, MutationKind, PersistError, PersistFuture, PersistedMutation,
    Persister,
};
use serde_json::{Value, json};
use tokio::time::Instant;

/// One recorded `persist` call.
#[derive(Debug, Clone)]
pub struct Call {
    pub started: Instant,
    pub mutations: Vec<MutationDescriptor>,
}

#[derive(Default)]
struct State {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
    on_error: AtomicUsize,
    next_id: AtomicU64,
}

/// In-memory backend with a fixed latency.
///
/// Relation and collection payloads without an `id` get the next sequential
/// id; scalar payloads are echoed back.
#[derive(Clone)]
pub struct SimulatedBackend {
    latency: Duration,
    state: Arc<State>,
}

impl SimulatedBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            state: Arc::new(State::default()),
        }
    }

    /// Make the `index`-th call (zero based) fail.
    pub fn fail_call(self, index: usize) -> Self {
        self.state.failing.lock().unwrap().insert(index);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().unwrap().len()
    }

    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn on_error_calls(&self) -> usize {
        self.state.on_error.load(Ordering::SeqCst)
    }
}

impl Persister for SimulatedBackend {
    fn persist(&self, _aggregate: Value, mutations: Vec<MutationDescriptor>) -> PersistFuture {
        let index = {
            let mut calls = self.state.calls.lock().unwrap();
            calls.push(Call {
                started: Instant::now(),
                mutations: mutations.clone(),
            });
            calls.len() - 1
        };
        let fail = self.state.failing.lock().unwrap().contains(&index);
        let latency = self.latency;
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            state.completed.fetch_add(1, Ordering::SeqCst);
            if fail {
                return Err(PersistError::Transport(format!("call {index} timed out")));
            }
            Ok(mutations
                .into_iter()
                .map(|descriptor| {
                    let result = match descriptor.kind() {
                        MutationKind::Scalar => descriptor.payload().clone(),
                        _ if descriptor.is_removal() => Value::Null,
                        _ if descriptor.payload().get("id").is_some() => json!({}),
                        _ => json!({"id": state.next_id.fetch_add(1, Ordering::SeqCst) + 100}),
                    };
                    PersistedMutation::new(descriptor, result)
                })
                .collect())
        })
    }

    fn on_error(&self, _failed: &[MutationDescriptor], _error: &PersistError) {
        self.state.on_error.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn rows() -> Equivalence {
    Equivalence::by_any_field(["id", "clientId"])
}

/// Let spawned dispatch tasks run without advancing the paused clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
