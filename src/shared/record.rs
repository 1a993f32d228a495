//! Record Types
//!
//! Entity-agnostic record shapes that flow through every plane. The layer
//! never interprets a record's `data`; it only routes, buffers and caches it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque record body
pub type Payload = Value;

/// Which backend an entity operation targets.
///
/// Every call through the gateway names its plane explicitly; there is no
/// default and no fallback from one plane to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plane {
    /// The global identity/profile backend shared by all tenants
    ControlPlane,
    /// The active tenant's isolated backend
    DataPlane,
}

/// A stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record id, unique within its collection
    pub id: String,
    /// Opaque record body
    pub data: Payload,
    /// Last modification time as reported by the store
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(id: impl Into<String>, data: Payload) -> Self {
        Self {
            id: id.into(),
            data,
            updated_at: Utc::now(),
        }
    }
}

/// Equality filter over top-level record fields.
///
/// All clauses must match. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Check a record body against every clause
    pub fn matches(&self, data: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }
}

/// Kind of change carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Live change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Collection the record belongs to
    pub collection: String,
    /// What happened to the record
    pub kind: ChangeKind,
    /// Record id
    pub record_id: String,
    /// Record state after the change (`None` for deletions)
    pub record: Option<Record>,
}

/// Apply an update patch on top of an existing body.
///
/// Object patches are merged key by key (a `null` value removes the key);
/// anything else replaces the body wholesale.
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (key, value) in patch {
                if value.is_null() {
                    merged.remove(key);
                } else {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
