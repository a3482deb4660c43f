//! Reconciliation between local edits and server-confirmed state.
//!
//! [`prepare`] runs before a batch is submitted: it merges each payload over
//! the previously known value so server-assigned identifiers and companion
//! fields the edit did not mention travel with it, and drops collection
//! deletes for elements that were never persisted.
//!
//! [`apply`] runs only after the persister resolved successfully and writes
//! the confirmed results back onto the aggregate. Collection lookups are
//! re-evaluated against the collection as already modified by earlier pairs
//! of the same batch.
//!
//! Merges follow object-spread semantics: a shallow, left-to-right field
//! merge in which layers that are not JSON objects contribute nothing.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::PersistError;
use crate::mutation::{MutationDescriptor, MutationKind, PersistedMutation, SubmittedMutation};
use crate::persist::{Persister, SharedAggregate, read_aggregate, write_aggregate};

/// Shallow left-to-right merge of object layers.
#[must_use]
pub fn spread(layers: &[&Value]) -> Value {
    let mut merged = Map::new();
    for layer in layers {
        if let Value::Object(fields) = layer {
            for (name, value) in fields {
                merged.insert(name.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Previously known value addressed by `descriptor`, if any.
#[must_use]
pub fn previous_value<'a>(aggregate: &'a Value, descriptor: &MutationDescriptor) -> Option<&'a Value> {
    let current = aggregate
        .get(descriptor.property())
        .filter(|value| !value.is_null())?;
    match descriptor.kind() {
        MutationKind::Scalar | MutationKind::Relation => Some(current),
        MutationKind::Collection => {
            let elements = current.as_array()?;
            descriptor.locate(elements).map(|index| &elements[index])
        }
    }
}

/// Prepare one descriptor for submission; `None` means skip the round trip.
#[must_use]
pub fn prepare_one(aggregate: &Value, descriptor: MutationDescriptor) -> Option<MutationDescriptor> {
    let previous = previous_value(aggregate, &descriptor);
    match descriptor.kind() {
        MutationKind::Scalar => Some(descriptor),
        MutationKind::Collection if descriptor.is_removal() && previous.is_none() => {
            debug!(
                property = descriptor.property(),
                "Dropping delete for element that was never persisted"
            );
            None
        }
        MutationKind::Relation | MutationKind::Collection => {
            let merged = spread(&[previous.unwrap_or(&Value::Null), descriptor.payload()]);
            Some(descriptor.with_payload(merged))
        }
    }
}

/// Prepare a whole batch, preserving order.
#[must_use]
pub fn prepare(aggregate: &Value, batch: Vec<MutationDescriptor>) -> Vec<MutationDescriptor> {
    batch
        .into_iter()
        .filter_map(|descriptor| prepare_one(aggregate, descriptor))
        .collect()
}

/// Write server-confirmed results onto the aggregate, pair by pair.
///
/// A non-object aggregate is replaced by an empty object first.
pub fn apply(aggregate: &mut Value, results: &[PersistedMutation]) {
    if !aggregate.is_object() {
        *aggregate = Value::Object(Map::new());
    }
    let Value::Object(fields) = aggregate else {
        return;
    };
    for persisted in results {
        apply_one(fields, persisted);
    }
}

fn apply_one(fields: &mut Map<String, Value>, persisted: &PersistedMutation) {
    let descriptor = &persisted.descriptor;
    let property = descriptor.property();
    match descriptor.kind() {
        MutationKind::Scalar => {
            let value = if descriptor.is_removal() {
                Value::Null
            } else {
                persisted.result.clone()
            };
            fields.insert(property.to_string(), value);
        }
        MutationKind::Relation => {
            let value = if descriptor.is_removal() {
                Value::Null
            } else {
                let previous = fields.get(property).unwrap_or(&Value::Null);
                spread(&[previous, descriptor.payload(), &persisted.result])
            };
            fields.insert(property.to_string(), value);
        }
        MutationKind::Collection => {
            let Some(elements) = fields.get_mut(property).and_then(Value::as_array_mut) else {
                if !descriptor.is_removal() {
                    let inserted = spread(&[descriptor.payload(), &persisted.result]);
                    fields.insert(property.to_string(), Value::Array(vec![inserted]));
                }
                return;
            };
            match (descriptor.locate(elements), descriptor.is_removal()) {
                (Some(index), true) => {
                    elements.remove(index);
                }
                (None, true) => {}
                (Some(index), false) => {
                    let merged = spread(&[&elements[index], descriptor.payload(), &persisted.result]);
                    elements[index] = merged;
                }
                (None, false) => {
                    elements.push(spread(&[descriptor.payload(), &persisted.result]));
                }
            }
        }
    }
}

/// Outcome of one prepare → persist → apply round.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Nothing survived preparation; the persister was not called.
    Skipped,
    /// The persister succeeded and its results were applied.
    Applied {
        submitted: Vec<SubmittedMutation>,
        results: Vec<PersistedMutation>,
    },
    /// The persister failed; the aggregate was not touched.
    Failed {
        submitted: Vec<SubmittedMutation>,
        error: PersistError,
    },
}

/// Prepare `batch` against `aggregate`, persist it, and apply the results.
///
/// The persist future runs on its own task so a panicking persister is
/// reported as [`PersistError::Aborted`] instead of taking the caller down.
pub async fn reconcile(
    aggregate: &SharedAggregate,
    batch: Vec<SubmittedMutation>,
    persister: &dyn Persister,
) -> ReconcileOutcome {
    let (snapshot, submitted) = {
        let guard = read_aggregate(aggregate);
        let submitted: Vec<SubmittedMutation> = batch
            .into_iter()
            .filter_map(|SubmittedMutation { key, descriptor }| {
                prepare_one(&guard, descriptor).map(|descriptor| SubmittedMutation { key, descriptor })
            })
            .collect();
        (guard.clone(), submitted)
    };

    if submitted.is_empty() {
        return ReconcileOutcome::Skipped;
    }

    let descriptors: Vec<MutationDescriptor> =
        submitted.iter().map(|m| m.descriptor.clone()).collect();
    let task = tokio::spawn(persister.persist(snapshot, descriptors));
    let persisted = match task.await {
        Ok(result) => result,
        Err(join_err) => Err(PersistError::Aborted(join_err.to_string())),
    };

    let results = match persisted {
        Ok(results) if results.len() == submitted.len() => results,
        Ok(results) => {
            return ReconcileOutcome::Failed {
                error: PersistError::ResultMismatch {
                    submitted: submitted.len(),
                    received: results.len(),
                },
                submitted,
            };
        }
        Err(error) => return ReconcileOutcome::Failed { submitted, error },
    };

    let applied = {
        let mut guard = write_aggregate(aggregate);
        apply(&mut guard, &results);
        guard.clone()
    };
    crate::events::isolate("on_applied", || persister.on_applied(&applied));

    ReconcileOutcome::Applied { submitted, results }
}
