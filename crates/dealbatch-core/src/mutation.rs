//! Mutation descriptors.
//!
//! A [`MutationDescriptor`] is an immutable record of one pending change to
//! one property (or one element of a collection property) of the shared
//! aggregate. Further edits are expressed by building a new descriptor.
//!
//! Pending entries are either a ready descriptor or a [`DeferredDescriptor`],
//! a producer resolved at snapshot time from the results of the batch that
//! ran just before it. That is how an edit can target a row whose server id
//! only exists once the in-flight batch lands.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResolveError;

/// Relationship shape targeted by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Plain field; the persisted result replaces the value.
    #[serde(alias = "property")]
    Scalar,
    /// Singular nested object.
    #[serde(alias = "object")]
    Relation,
    /// Array of nested objects addressed through an [`Equivalence`].
    #[serde(alias = "array")]
    Collection,
}

impl MutationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Relation => "relation",
            Self::Collection => "collection",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scalar" | "property" => Ok(Self::Scalar),
            "relation" | "object" => Ok(Self::Relation),
            "collection" | "array" => Ok(Self::Collection),
            _ => Err(format!(
                "unknown mutation kind: {s}. Expected one of: scalar, relation, collection"
            )),
        }
    }
}

type EquivalenceFn = dyn Fn(&Value, &Value) -> bool + Send + Sync;

/// Predicate locating a collection element independent of server identity.
///
/// Called as `matches(element, candidate)` where `element` is an entry of the
/// target collection and `candidate` is the descriptor payload.
#[derive(Clone)]
pub struct Equivalence(Arc<EquivalenceFn>);

impl Equivalence {
    pub fn new(predicate: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Elements match when both carry the same non-null value for `field`.
    pub fn by_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(move |element, candidate| field_matches(element, candidate, &field) == Some(true))
    }

    /// The first field present (non-null) on both sides decides the match.
    ///
    /// Lets a row be found by a client-side id before the server id exists,
    /// and by the server id afterwards: `by_any_field(["id", "clientId"])`.
    pub fn by_any_field<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        Self::new(move |element, candidate| {
            fields
                .iter()
                .find_map(|field| field_matches(element, candidate, field))
                .unwrap_or(false)
        })
    }

    #[must_use]
    pub fn matches(&self, element: &Value, candidate: &Value) -> bool {
        (self.0)(element, candidate)
    }
}

impl fmt::Debug for Equivalence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Equivalence(..)")
    }
}

/// `None` when either side lacks the field.
fn field_matches(element: &Value, candidate: &Value, field: &str) -> Option<bool> {
    let left = element.get(field).filter(|v| !v.is_null())?;
    let right = candidate.get(field).filter(|v| !v.is_null())?;
    Some(left == right)
}

/// One pending change to one property or one collection element.
#[derive(Debug, Clone, Serialize)]
pub struct MutationDescriptor {
    kind: MutationKind,
    property: String,
    payload: Value,
    remove: bool,
    #[serde(skip)]
    equivalence: Option<Equivalence>,
}

impl MutationDescriptor {
    /// Set a plain field.
    pub fn scalar(property: impl Into<String>, value: Value) -> Self {
        Self {
            kind: MutationKind::Scalar,
            property: property.into(),
            payload: value,
            remove: false,
            equivalence: None,
        }
    }

    /// Clear a plain field.
    pub fn remove_scalar(property: impl Into<String>) -> Self {
        Self {
            remove: true,
            ..Self::scalar(property, Value::Null)
        }
    }

    /// Create or update a singular nested object (partial payloads allowed).
    pub fn relation(property: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Relation,
            property: property.into(),
            payload,
            remove: false,
            equivalence: None,
        }
    }

    /// Clear a singular nested object.
    pub fn remove_relation(property: impl Into<String>) -> Self {
        Self {
            remove: true,
            ..Self::relation(property, Value::Null)
        }
    }

    /// Insert or update one element of a collection.
    pub fn collection(
        property: impl Into<String>,
        payload: Value,
        equivalence: Equivalence,
    ) -> Self {
        Self {
            kind: MutationKind::Collection,
            property: property.into(),
            payload,
            remove: false,
            equivalence: Some(equivalence),
        }
    }

    /// Delete one element of a collection; `payload` only needs the fields
    /// the equivalence looks at.
    pub fn remove_element(
        property: impl Into<String>,
        payload: Value,
        equivalence: Equivalence,
    ) -> Self {
        Self {
            remove: true,
            ..Self::collection(property, payload, equivalence)
        }
    }

    /// A new descriptor identical to this one except for its payload.
    #[must_use]
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    #[must_use]
    pub fn property(&self) -> &str {
        &self.property
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.remove
    }

    #[must_use]
    pub fn equivalence(&self) -> Option<&Equivalence> {
        self.equivalence.as_ref()
    }

    /// Index of the element this descriptor addresses in `elements`.
    ///
    /// Always `None` for descriptors without an equivalence predicate.
    #[must_use]
    pub fn locate(&self, elements: &[Value]) -> Option<usize> {
        let equivalence = self.equivalence.as_ref()?;
        elements
            .iter()
            .position(|element| equivalence.matches(element, &self.payload))
    }
}

/// A server-confirmed result paired with the descriptor that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedMutation {
    pub result: Value,
    pub descriptor: MutationDescriptor,
}

impl PersistedMutation {
    #[must_use]
    pub fn new(descriptor: MutationDescriptor, result: Value) -> Self {
        Self { result, descriptor }
    }
}

/// Find the persisted result for the element `probe` identifies in `property`.
///
/// Matching uses each persisted descriptor's own equivalence against its
/// submitted payload, so a producer can look up the row it depends on by
/// the client-side fields it already knows.
#[must_use]
pub fn find_result<'a>(
    results: &'a [PersistedMutation],
    property: &str,
    probe: &Value,
) -> Option<&'a PersistedMutation> {
    results.iter().find(|persisted| {
        let descriptor = &persisted.descriptor;
        descriptor.property() == property
            && match descriptor.equivalence() {
                Some(equivalence) => equivalence.matches(descriptor.payload(), probe),
                None => true,
            }
    })
}

/// A descriptor paired with the pending-set key it was queued under.
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedMutation {
    pub key: String,
    pub descriptor: MutationDescriptor,
}

type DeferredFn = dyn FnOnce(&[PersistedMutation], &[MutationDescriptor]) -> Result<MutationDescriptor, ResolveError>
    + Send;

/// Producer resolved into a descriptor once the previous batch is known.
///
/// Receives the results and submitted descriptors of the dispatch that ran
/// immediately before it in the same chain (both empty when there was none).
pub struct DeferredDescriptor(Box<DeferredFn>);

impl DeferredDescriptor {
    pub fn new(
        producer: impl FnOnce(&[PersistedMutation], &[MutationDescriptor]) -> Result<MutationDescriptor, ResolveError>
        + Send
        + 'static,
    ) -> Self {
        Self(Box::new(producer))
    }

    pub fn resolve(
        self,
        previous_results: &[PersistedMutation],
        previous_descriptors: &[MutationDescriptor],
    ) -> Result<MutationDescriptor, ResolveError> {
        (self.0)(previous_results, previous_descriptors)
    }
}

impl fmt::Debug for DeferredDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeferredDescriptor(..)")
    }
}

/// Value stored in the pending set.
#[derive(Debug)]
pub enum PendingEntry {
    Ready(MutationDescriptor),
    Deferred(DeferredDescriptor),
}

impl PendingEntry {
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl From<MutationDescriptor> for PendingEntry {
    fn from(descriptor: MutationDescriptor) -> Self {
        Self::Ready(descriptor)
    }
}

impl From<DeferredDescriptor> for PendingEntry {
    fn from(producer: DeferredDescriptor) -> Self {
        Self::Deferred(producer)
    }
}
