//! Replay script format.
//!
//! ```json
//! {
//!   "aggregate": {"title": "Draft", "tickets": []},
//!   "steps": [
//!     {"op": "add", "kind": "collection", "property": "tickets", "payload": {"clientId": "r1"}},
//!     {"op": "sleep", "ms": 50},
//!     {"op": "flush", "lock": true},
//!     {"op": "unlock"}
//!   ]
//! }
//! ```

use anyhow::{Context, bail};
use dealbatch_core::{Equivalence, MutationDescriptor, MutationKind};
use serde::Deserialize;
use serde_json::Value;

/// Fields used to match collection elements when a step names none.
const DEFAULT_MATCH: [&str; 2] = ["id", "clientId"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default = "empty_object")]
    pub aggregate: Value,
    pub steps: Vec<Step>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MatchOn {
    One(String),
    Many(Vec<String>),
}

impl MatchOn {
    fn fields(&self) -> Vec<String> {
        match self {
            Self::One(field) => vec![field.clone()],
            Self::Many(fields) => fields.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Add {
        key: Option<String>,
        kind: MutationKind,
        property: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        remove: bool,
        #[serde(rename = "match")]
        match_on: Option<MatchOn>,
    },
    Flush {
        #[serde(default)]
        lock: bool,
    },
    Unlock,
    Sleep {
        ms: u64,
    },
}

impl Script {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("invalid replay script")
    }
}

/// Turn an `add` step into its pending-set key and descriptor.
pub fn descriptor_for(
    key: Option<&str>,
    kind: MutationKind,
    property: &str,
    payload: Value,
    remove: bool,
    match_on: Option<&MatchOn>,
) -> anyhow::Result<(String, MutationDescriptor)> {
    if property.is_empty() {
        bail!("add step needs a non-empty property");
    }
    let descriptor = match (kind, remove) {
        (MutationKind::Scalar, false) => MutationDescriptor::scalar(property, payload),
        (MutationKind::Scalar, true) => MutationDescriptor::remove_scalar(property),
        (MutationKind::Relation, false) => MutationDescriptor::relation(property, payload),
        (MutationKind::Relation, true) => MutationDescriptor::remove_relation(property),
        (MutationKind::Collection, remove) => {
            let fields = match_on.map_or_else(
                || DEFAULT_MATCH.iter().map(ToString::to_string).collect(),
                MatchOn::fields,
            );
            if fields.is_empty() {
                bail!("collection step on {property} has an empty match list");
            }
            let row = row_key(&payload, &fields)
                .with_context(|| format!("collection step on {property} has no value for {fields:?}"))?;
            let equivalence = Equivalence::by_any_field(fields);
            let descriptor = if remove {
                MutationDescriptor::remove_element(property, payload, equivalence)
            } else {
                MutationDescriptor::collection(property, payload, equivalence)
            };
            let key = key.map_or_else(|| format!("{property}:{row}"), str::to_string);
            return Ok((key, descriptor));
        }
    };
    let key = key.unwrap_or(property).to_string();
    Ok((key, descriptor))
}

fn row_key(payload: &Value, fields: &[String]) -> Option<String> {
    fields.iter().find_map(|field| match payload.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}
