//! # Pending Write Queue Types
//!
//! The shape of buffered mutations and the coalescing rules applied when a
//! new one is enqueued.
//!
//! ## Coalescing
//!
//! A new write is compared only against the newest record for the same
//! `(tenant, collection, record_id)` key, and only if that record is still
//! pending (not claimed by a reconciliation pass):
//!
//! | newest  | new     | result                                   |
//! |---------|---------|------------------------------------------|
//! | create  | update  | one create carrying the merged payload   |
//! | create  | delete  | both dropped, nothing reaches the remote |
//! | other   | any     | appended                                 |
//!
//! Two updates are never merged, so per-collection replay order holds.

use crate::shared::{merge_patch, BufferError, Payload};
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

impl WriteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOp::Create => "create",
            WriteOp::Update => "update",
            WriteOp::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BufferError> {
        match value {
            "create" => Ok(WriteOp::Create),
            "update" => Ok(WriteOp::Update),
            "delete" => Ok(WriteOp::Delete),
            other => Err(BufferError::corrupt(format!("unknown operation {:?}", other))),
        }
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a reconciliation pass has claimed the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    Pending,
    InFlight,
}

impl WriteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteState::Pending => "pending",
            WriteState::InFlight => "in_flight",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BufferError> {
        match value {
            "pending" => Ok(WriteState::Pending),
            "in_flight" => Ok(WriteState::InFlight),
            other => Err(BufferError::corrupt(format!("unknown write state {:?}", other))),
        }
    }
}

/// A mutation about to be buffered
#[derive(Debug, Clone, PartialEq)]
pub struct NewWrite {
    pub tenant_id: TenantId,
    pub collection: String,
    pub record_id: String,
    pub op: WriteOp,
    /// Full body for creates, patch for updates, `None` for deletes
    pub payload: Option<Payload>,
}

impl NewWrite {
    pub fn create(tenant_id: TenantId, collection: impl Into<String>, record_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            tenant_id,
            collection: collection.into(),
            record_id: record_id.into(),
            op: WriteOp::Create,
            payload: Some(payload),
        }
    }

    pub fn update(tenant_id: TenantId, collection: impl Into<String>, record_id: impl Into<String>, patch: Payload) -> Self {
        Self {
            tenant_id,
            collection: collection.into(),
            record_id: record_id.into(),
            op: WriteOp::Update,
            payload: Some(patch),
        }
    }

    pub fn delete(tenant_id: TenantId, collection: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            collection: collection.into(),
            record_id: record_id.into(),
            op: WriteOp::Delete,
            payload: None,
        }
    }
}

/// A buffered mutation
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub local_id: Uuid,
    /// Creation order; strictly increasing across the buffer
    pub seq: i64,
    pub tenant_id: TenantId,
    pub collection: String,
    pub record_id: String,
    pub op: WriteOp,
    pub payload: Option<Payload>,
    pub created_at: DateTime<Utc>,
    /// Failed application attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub state: WriteState,
}

/// What `enqueue` did with a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Stored as a new record
    Appended(Uuid),
    /// Folded into the pending create with this id
    Coalesced(Uuid),
    /// Cancelled the pending create with this id; nothing is stored
    Annihilated(Uuid),
}

impl EnqueueOutcome {
    /// Id of the record the write ended up in (or cancelled)
    pub fn local_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Appended(id)
            | EnqueueOutcome::Coalesced(id)
            | EnqueueOutcome::Annihilated(id) => *id,
        }
    }
}

/// Coalescing decision for a new write
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueuePlan {
    Append,
    /// Replace the payload of the pending create `local_id`
    MergeInto { local_id: Uuid, payload: Payload },
    /// Delete the pending create `local_id` and store nothing
    DropBoth { local_id: Uuid },
}

/// Decide how `write` combines with the newest record for its key
pub fn plan(newest: Option<&PendingWrite>, write: &NewWrite) -> EnqueuePlan {
    let Some(newest) = newest else {
        return EnqueuePlan::Append;
    };
    if newest.state != WriteState::Pending || newest.op != WriteOp::Create {
        return EnqueuePlan::Append;
    }
    match write.op {
        WriteOp::Update => {
            let base = newest.payload.clone().unwrap_or(Payload::Null);
            let patch = write.payload.clone().unwrap_or(Payload::Null);
            EnqueuePlan::MergeInto {
                local_id: newest.local_id,
                payload: merge_patch(&base, &patch),
            }
        }
        WriteOp::Delete => EnqueuePlan::DropBoth {
            local_id: newest.local_id,
        },
        WriteOp::Create => EnqueuePlan::Append,
    }
}
