//! # Local Write Buffer
//!
//! Durable queue of pending mutations plus the dead-letter log, sync
//! cursors and the read cache, all in the local SQLite database.
//!
//! ## Locking
//!
//! There is no buffer-wide lock. Enqueues serialize per record key through
//! an in-process keyed lock; the reconciler claims rows with conditional
//! `UPDATE ... WHERE state = 'pending'` statements. Coalescing only touches
//! rows that are still pending, so a claimed row is never modified.
//!
//! ## Recovery
//!
//! [`LocalWriteBuffer::open`] returns rows left `in_flight` by a crash to
//! `pending` before the buffer exists, so every unacknowledged write is
//! visible before the first new mutation is accepted.

use super::queue::{plan, EnqueueOutcome, EnqueuePlan, NewWrite, PendingWrite, WriteOp, WriteState};
use crate::local_db::schema::{decode_time, encode_time};
use crate::local_db::LocalDatabase;
use crate::shared::{merge_patch, BufferError, Filter, Record};
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Result type for buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;

/// Why a write was moved to the dead-letter log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The remote store refused the write outright
    Permanent,
    /// The write kept failing transiently past the retry ceiling
    RetryCeilingExceeded,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Permanent => "permanent",
            FailureClass::RetryCeilingExceeded => "retry_ceiling_exceeded",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "permanent" => Ok(FailureClass::Permanent),
            "retry_ceiling_exceeded" => Ok(FailureClass::RetryCeilingExceeded),
            other => Err(BufferError::corrupt(format!("unknown failure class {:?}", other))),
        }
    }
}

/// A write that will not be retried automatically
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub local_id: Uuid,
    pub seq: i64,
    pub tenant_id: TenantId,
    pub collection: String,
    pub record_id: String,
    pub op: WriteOp,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub reason: String,
    pub failure_class: FailureClass,
    pub failed_at: DateTime<Utc>,
}

type RecordKey = (TenantId, String, String);

/// Per-record async locks, dropped when no longer held
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<RecordKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: RecordKey) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(&key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

/// Durable buffer of pending writes
#[derive(Debug)]
pub struct LocalWriteBuffer {
    db: LocalDatabase,
    key_locks: KeyLocks,
}

impl LocalWriteBuffer {
    /// Open the buffer, recovering writes interrupted mid-flight
    pub async fn open(db: LocalDatabase) -> Result<Self> {
        let recovered = sqlx::query("UPDATE pending_writes SET state = 'pending' WHERE state = 'in_flight'")
            .execute(db.pool())
            .await?
            .rows_affected();
        if recovered > 0 {
            tracing::warn!("[Buffer] Recovered {} writes interrupted mid-flight", recovered);
        }

        let (pending,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_writes")
            .fetch_one(db.pool())
            .await?;
        tracing::info!("[Buffer] Opened with {} pending writes", pending);

        Ok(Self {
            db,
            key_locks: KeyLocks::default(),
        })
    }

    pub fn database(&self) -> &LocalDatabase {
        &self.db
    }

    /// Buffer a mutation, coalescing with a pending create for the same record
    pub async fn enqueue(&self, write: NewWrite) -> Result<EnqueueOutcome> {
        let key = (write.tenant_id.clone(), write.collection.clone(), write.record_id.clone());
        let _key_guard = self.key_locks.lock(key).await;

        let newest = sqlx::query(
            "SELECT * FROM pending_writes
             WHERE tenant_id = ? AND collection = ? AND record_id = ?
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(write.tenant_id.as_str())
        .bind(&write.collection)
        .bind(&write.record_id)
        .fetch_optional(self.db.pool())
        .await?
        .map(|row| pending_from_row(&row))
        .transpose()?;

        match plan(newest.as_ref(), &write) {
            EnqueuePlan::MergeInto { local_id, payload } => {
                let merged = sqlx::query(
                    "UPDATE pending_writes SET payload = ? WHERE local_id = ? AND state = 'pending'",
                )
                .bind(serde_json::to_string(&payload)?)
                .bind(local_id.to_string())
                .execute(self.db.pool())
                .await?
                .rows_affected();
                if merged == 1 {
                    tracing::debug!("[Buffer] Coalesced update of {}/{} into {}", write.collection, write.record_id, local_id);
                    return Ok(EnqueueOutcome::Coalesced(local_id));
                }
            }
            EnqueuePlan::DropBoth { local_id } => {
                let dropped = sqlx::query("DELETE FROM pending_writes WHERE local_id = ? AND state = 'pending'")
                    .bind(local_id.to_string())
                    .execute(self.db.pool())
                    .await?
                    .rows_affected();
                if dropped == 1 {
                    tracing::debug!("[Buffer] Delete of {}/{} cancelled pending create {}", write.collection, write.record_id, local_id);
                    return Ok(EnqueueOutcome::Annihilated(local_id));
                }
            }
            EnqueuePlan::Append => {}
        }

        // Either nothing to coalesce with, or the target was claimed between
        // the read and the conditional write.
        self.append(&write).await.map(EnqueueOutcome::Appended)
    }

    async fn append(&self, write: &NewWrite) -> Result<Uuid> {
        let local_id = Uuid::new_v4();
        let payload = write.payload.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO pending_writes
                (local_id, tenant_id, collection, record_id, operation, payload, created_at, attempts, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'pending')",
        )
        .bind(local_id.to_string())
        .bind(write.tenant_id.as_str())
        .bind(&write.collection)
        .bind(&write.record_id)
        .bind(write.op.as_str())
        .bind(payload)
        .bind(encode_time(&Utc::now()))
        .execute(self.db.pool())
        .await?;
        tracing::debug!("[Buffer] Queued {} {}/{} as {}", write.op, write.collection, write.record_id, local_id);
        Ok(local_id)
    }

    /// Every buffered write for `tenant`, in creation order
    pub async fn drainable(&self, tenant: &TenantId) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query("SELECT * FROM pending_writes WHERE tenant_id = ? ORDER BY seq ASC")
            .bind(tenant.as_str())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(pending_from_row).collect()
    }

    /// Mark a pending write as claimed by a reconciliation pass.
    ///
    /// Returns `false` if it is gone or already claimed.
    pub async fn claim(&self, local_id: Uuid) -> Result<bool> {
        let claimed = sqlx::query(
            "UPDATE pending_writes SET state = 'in_flight', last_attempt_at = ?
             WHERE local_id = ? AND state = 'pending'",
        )
        .bind(encode_time(&Utc::now()))
        .bind(local_id.to_string())
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }

    /// Return a claimed write to pending without counting an attempt
    pub async fn release(&self, local_id: Uuid) -> Result<bool> {
        let released = sqlx::query(
            "UPDATE pending_writes SET state = 'pending' WHERE local_id = ? AND state = 'in_flight'",
        )
        .bind(local_id.to_string())
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(released == 1)
    }

    /// Return every claimed write of `tenant` to pending.
    ///
    /// Claims only live for the duration of one pass; anything still claimed
    /// when a pass starts belongs to a pass that was dropped mid-write.
    pub async fn release_claims(&self, tenant: &TenantId) -> Result<u64> {
        let released = sqlx::query(
            "UPDATE pending_writes SET state = 'pending' WHERE tenant_id = ? AND state = 'in_flight'",
        )
        .bind(tenant.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(released)
    }

    /// Remove a write confirmed by the remote store
    pub async fn ack(&self, local_id: Uuid) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM pending_writes WHERE local_id = ?")
            .bind(local_id.to_string())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(removed == 1)
    }

    /// Record a failed attempt and return the write to pending.
    ///
    /// Returns the new attempt count.
    pub async fn fail(&self, local_id: Uuid, error: &str) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE pending_writes
             SET attempts = attempts + 1, last_error = ?, last_attempt_at = ?, state = 'pending'
             WHERE local_id = ?
             RETURNING attempts",
        )
        .bind(error)
        .bind(encode_time(&Utc::now()))
        .bind(local_id.to_string())
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| BufferError::corrupt(format!("no pending write {}", local_id)))?;
        let attempts: i64 = row.try_get("attempts")?;
        Ok(attempts as u32)
    }

    /// Move a write to the dead-letter log
    pub async fn dead_letter(&self, local_id: Uuid, reason: &str, class: FailureClass) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;
        let moved = sqlx::query(
            "INSERT OR REPLACE INTO dead_letters
                (local_id, seq, tenant_id, collection, record_id, operation, payload, created_at,
                 attempts, last_error, reason, failure_class, failed_at)
             SELECT local_id, seq, tenant_id, collection, record_id, operation, payload, created_at,
                 attempts, last_error, ?, ?, ?
             FROM pending_writes WHERE local_id = ?",
        )
        .bind(reason)
        .bind(class.as_str())
        .bind(encode_time(&Utc::now()))
        .bind(local_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM pending_writes WHERE local_id = ?")
            .bind(local_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if moved == 1 {
            tracing::warn!("[Buffer] Dead-lettered {} ({}): {}", local_id, class.as_str(), reason);
        }
        Ok(moved == 1)
    }

    /// Dead letters, newest first; all tenants when `tenant` is `None`
    pub async fn dead_letters(&self, tenant: Option<&TenantId>) -> Result<Vec<DeadLetter>> {
        let rows = match tenant {
            Some(tenant) => {
                sqlx::query("SELECT * FROM dead_letters WHERE tenant_id = ? ORDER BY failed_at DESC, seq DESC")
                    .bind(tenant.as_str())
                    .fetch_all(self.db.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM dead_letters ORDER BY failed_at DESC, seq DESC")
                    .fetch_all(self.db.pool())
                    .await?
            }
        };
        rows.iter().map(dead_letter_from_row).collect()
    }

    /// Drop one dead letter
    pub async fn discard_dead_letter(&self, local_id: Uuid) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM dead_letters WHERE local_id = ?")
            .bind(local_id.to_string())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(removed == 1)
    }

    pub async fn is_dead_lettered(&self, local_id: Uuid) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE local_id = ?")
            .bind(local_id.to_string())
            .fetch_one(self.db.pool())
            .await?;
        Ok(count > 0)
    }

    pub async fn pending_count(&self, tenant: &TenantId) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_writes WHERE tenant_id = ?")
            .bind(tenant.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(count as u64)
    }

    pub async fn dead_letter_count(&self, tenant: &TenantId) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE tenant_id = ?")
            .bind(tenant.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(count as u64)
    }

    /// Whether `collection` has any buffered write for `tenant`
    pub async fn has_pending(&self, tenant: &TenantId, collection: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_writes WHERE tenant_id = ? AND collection = ?")
                .bind(tenant.as_str())
                .bind(collection)
                .fetch_one(self.db.pool())
                .await?;
        Ok(count > 0)
    }

    pub async fn is_pending(&self, local_id: Uuid) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_writes WHERE local_id = ?")
            .bind(local_id.to_string())
            .fetch_one(self.db.pool())
            .await?;
        Ok(count > 0)
    }

    /// Last successful reconciliation for a collection
    pub async fn cursor(&self, tenant: &TenantId, collection: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_synced_at FROM sync_cursors WHERE tenant_id = ? AND collection = ?")
                .bind(tenant.as_str())
                .bind(collection)
                .fetch_optional(self.db.pool())
                .await?;
        row.map(|(at,)| decode_time(&at)).transpose()
    }

    pub async fn advance_cursor(&self, tenant: &TenantId, collection: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_cursors (tenant_id, collection, last_synced_at) VALUES (?, ?, ?)
             ON CONFLICT (tenant_id, collection)
             DO UPDATE SET last_synced_at = MAX(last_synced_at, excluded.last_synced_at)",
        )
        .bind(tenant.as_str())
        .bind(collection)
        .bind(encode_time(&at))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Store the last known state of a record
    pub async fn cache_put(&self, tenant: &TenantId, collection: &str, record: &Record) -> Result<()> {
        sqlx::query(
            "INSERT INTO cached_records (tenant_id, collection, record_id, payload, updated_at, cached_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (tenant_id, collection, record_id)
             DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at, cached_at = excluded.cached_at",
        )
        .bind(tenant.as_str())
        .bind(collection)
        .bind(&record.id)
        .bind(serde_json::to_string(&record.data)?)
        .bind(encode_time(&record.updated_at))
        .bind(encode_time(&Utc::now()))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn cache_get(&self, tenant: &TenantId, collection: &str, id: &str) -> Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT record_id, payload, updated_at FROM cached_records
             WHERE tenant_id = ? AND collection = ? AND record_id = ?",
        )
        .bind(tenant.as_str())
        .bind(collection)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(|row| cached_from_row(&row)).transpose()
    }

    /// Cached records of a collection, ordered by id
    pub async fn cache_list(&self, tenant: &TenantId, collection: &str, filter: Option<&Filter>) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT record_id, payload, updated_at FROM cached_records
             WHERE tenant_id = ? AND collection = ? ORDER BY record_id",
        )
        .bind(tenant.as_str())
        .bind(collection)
        .fetch_all(self.db.pool())
        .await?;
        let records = rows.iter().map(cached_from_row).collect::<Result<Vec<_>>>()?;
        Ok(records
            .into_iter()
            .filter(|r| filter.map_or(true, |f| f.matches(&r.data)))
            .collect())
    }

    /// Whether anything is cached for a collection
    pub async fn cache_has(&self, tenant: &TenantId, collection: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM cached_records WHERE tenant_id = ? AND collection = ?")
                .bind(tenant.as_str())
                .bind(collection)
                .fetch_one(self.db.pool())
                .await?;
        Ok(count > 0)
    }

    pub async fn cache_remove(&self, tenant: &TenantId, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cached_records WHERE tenant_id = ? AND collection = ? AND record_id = ?")
            .bind(tenant.as_str())
            .bind(collection)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Replace the cached contents of a collection with a fresh listing
    pub async fn cache_replace(&self, tenant: &TenantId, collection: &str, records: &[Record]) -> Result<()> {
        let cached_at = encode_time(&Utc::now());
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM cached_records WHERE tenant_id = ? AND collection = ?")
            .bind(tenant.as_str())
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        for record in records {
            sqlx::query(
                "INSERT INTO cached_records (tenant_id, collection, record_id, payload, updated_at, cached_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(tenant.as_str())
            .bind(collection)
            .bind(&record.id)
            .bind(serde_json::to_string(&record.data)?)
            .bind(encode_time(&record.updated_at))
            .bind(&cached_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Reflect a buffered write in the cache before it reaches the remote
    pub async fn apply_optimistic(&self, write: &NewWrite) -> Result<()> {
        let tenant = &write.tenant_id;
        match write.op {
            WriteOp::Create => {
                let data = write.payload.clone().unwrap_or(serde_json::Value::Null);
                self.cache_put(tenant, &write.collection, &Record::new(&write.record_id, data))
                    .await
            }
            WriteOp::Update => {
                let patch = write.payload.clone().unwrap_or(serde_json::Value::Null);
                let data = match self.cache_get(tenant, &write.collection, &write.record_id).await? {
                    Some(existing) => merge_patch(&existing.data, &patch),
                    None => patch,
                };
                self.cache_put(tenant, &write.collection, &Record::new(&write.record_id, data))
                    .await
            }
            WriteOp::Delete => self.cache_remove(tenant, &write.collection, &write.record_id).await,
        }
    }
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| BufferError::corrupt(format!("bad local id {:?}: {}", text, e)))
}

fn parse_payload(text: Option<String>) -> Result<Option<serde_json::Value>> {
    text.map(|t| serde_json::from_str(&t)).transpose().map_err(BufferError::from)
}

fn pending_from_row(row: &SqliteRow) -> Result<PendingWrite> {
    let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;
    Ok(PendingWrite {
        local_id: parse_uuid(&row.try_get::<String, _>("local_id")?)?,
        seq: row.try_get("seq")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        collection: row.try_get("collection")?,
        record_id: row.try_get("record_id")?,
        op: WriteOp::parse(&row.try_get::<String, _>("operation")?)?,
        payload: parse_payload(row.try_get("payload")?)?,
        created_at: decode_time(&row.try_get::<String, _>("created_at")?)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
        last_attempt_at: last_attempt_at.as_deref().map(decode_time).transpose()?,
        state: WriteState::parse(&row.try_get::<String, _>("state")?)?,
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetter> {
    Ok(DeadLetter {
        local_id: parse_uuid(&row.try_get::<String, _>("local_id")?)?,
        seq: row.try_get("seq")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        collection: row.try_get("collection")?,
        record_id: row.try_get("record_id")?,
        op: WriteOp::parse(&row.try_get::<String, _>("operation")?)?,
        payload: parse_payload(row.try_get("payload")?)?,
        created_at: decode_time(&row.try_get::<String, _>("created_at")?)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
        reason: row.try_get("reason")?,
        failure_class: FailureClass::parse(&row.try_get::<String, _>("failure_class")?)?,
        failed_at: decode_time(&row.try_get::<String, _>("failed_at")?)?,
    })
}

fn cached_from_row(row: &SqliteRow) -> Result<Record> {
    let payload: String = row.try_get("payload")?;
    Ok(Record {
        id: row.try_get("record_id")?,
        data: serde_json::from_str(&payload)?,
        updated_at: decode_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}
