//! In-memory stand-in for the deal API.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dealbatch_core::{
    MutationDescriptor, MutationKind, PersistError, PersistFuture, PersistedMutation, Persister,
};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Persister that answers locally after a fixed latency.
///
/// Calls are numbered from 1. Relation and collection payloads without an
/// `id` receive the next sequential id; scalar payloads are echoed back.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    latency: Duration,
    failing: Arc<BTreeSet<u64>>,
    calls: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
}

impl SimulatedBackend {
    pub fn new(latency: Duration, failing: impl IntoIterator<Item = u64>) -> Self {
        Self {
            latency,
            failing: Arc::new(failing.into_iter().collect()),
            calls: Arc::new(AtomicU64::new(0)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Persister for SimulatedBackend {
    fn persist(&self, _aggregate: Value, mutations: Vec<MutationDescriptor>) -> PersistFuture {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self.failing.contains(&call);
        let latency = self.latency;
        let next_id = Arc::clone(&self.next_id);
        info!(call, mutations = mutations.len(), "Simulated backend received batch");

        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if fail {
                return Err(PersistError::Rejected(format!("simulated failure for call {call}")));
            }
            Ok(mutations
                .into_iter()
                .map(|descriptor| {
                    let result = result_for(&descriptor, &next_id);
                    PersistedMutation::new(descriptor, result)
                })
                .collect())
        })
    }

    fn on_error(&self, failed: &[MutationDescriptor], error: &PersistError) {
        warn!(mutations = failed.len(), error = %error, "Simulated backend batch failed");
    }
}

fn result_for(descriptor: &MutationDescriptor, next_id: &AtomicU64) -> Value {
    match descriptor.kind() {
        MutationKind::Scalar => descriptor.payload().clone(),
        _ if descriptor.is_removal() => Value::Null,
        _ => match descriptor.payload().get("id") {
            Some(id) if !id.is_null() => json!({ "id": id }),
            _ => json!({ "id": next_id.fetch_add(1, Ordering::SeqCst) + 1 }),
        },
    }
}
