//! # Sync Reconciliation
//!
//! Replays buffered writes through the active connection handle.
//!
//! ## Pass Algorithm
//!
//! A pass runs only while online with an active handle, and only over the
//! active tenant's writes. Claims left behind by a pass that was dropped
//! mid-write are released first. Writes are grouped by collection, keeping
//! creation order inside each group. For each group, the head write is
//! claimed and applied:
//!
//! - success (or an idempotent replay: create hitting `AlreadyExists`,
//!   delete hitting `NotFound`): acknowledge, advance the cursor, continue
//! - transient failure: count the attempt and stop this collection; other
//!   collections continue
//! - permanent failure: dead-letter, continue
//! - attempts past the retry ceiling: dead-letter regardless of class
//! - handle cancelled: release the claim and end the pass
//!
//! A pass that dead-letters anything publishes one `SyncIncomplete` event.
//!
//! ## Single Flight
//!
//! A latch is taken before the first await and released by a drop guard.
//! A call that finds the latch taken requests one follow-up pass from the
//! running call and returns immediately.

use super::buffer::{FailureClass, LocalWriteBuffer};
use super::queue::{PendingWrite, WriteOp};
use super::retry::RetryPolicy;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::connectivity::ConnectivityMonitor;
use crate::shared::{AccessError, Listeners, StoreError, SyncError};
use crate::tenant::TenantId;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Summary of one `reconcile` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Tenant the passes ran for
    pub tenant: Option<TenantId>,
    /// Passes executed (follow-up passes included)
    pub passes: u32,
    /// Writes applied by the remote store
    pub applied: usize,
    /// Writes the remote store had already seen
    pub replayed: usize,
    /// Writes that failed transiently and stay queued
    pub deferred: usize,
    pub dead_lettered: Vec<Uuid>,
    /// Replicated collections re-fetched into the cache
    pub refreshed: Vec<String>,
    /// A pass ended early because the handle was closed
    pub cancelled: bool,
    /// The call was folded into a pass already running
    pub coalesced: bool,
    /// Nothing ran because the monitor reports offline
    pub skipped_offline: bool,
}

impl ReconcileReport {
    fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }

    /// Whether every write seen was synced
    pub fn is_clean(&self) -> bool {
        self.deferred == 0 && self.dead_lettered.is_empty() && !self.cancelled
    }

    fn absorb(&mut self, pass: ReconcileReport) {
        if pass.tenant.is_some() {
            self.tenant = pass.tenant;
        }
        self.passes += pass.passes;
        self.applied += pass.applied;
        self.replayed += pass.replayed;
        self.deferred = pass.deferred;
        self.dead_lettered.extend(pass.dead_lettered);
        self.refreshed.extend(pass.refreshed);
        self.cancelled |= pass.cancelled;
        self.skipped_offline |= pass.skipped_offline;
    }
}

/// Reconciliation lifecycle events
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PassStarted { tenant: TenantId },
    PassFinished(ReconcileReport),
    /// Some changes could not be synced and were dead-lettered
    SyncIncomplete { tenant: TenantId, dead_lettered: Vec<Uuid> },
}

enum Step {
    Next,
    StopCollection,
    EndPass,
}

/// Releases the single-flight latch when dropped
struct Latch<'a> {
    flag: &'a AtomicBool,
}

impl Drop for Latch<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drains the write buffer through the active connection
pub struct SyncReconciler {
    buffer: Arc<LocalWriteBuffer>,
    connections: Arc<ConnectionManager>,
    monitor: ConnectivityMonitor,
    policy: RetryPolicy,
    replicated: Vec<String>,
    running: AtomicBool,
    rerun: AtomicBool,
    events: Listeners<SyncEvent>,
}

impl std::fmt::Debug for SyncReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReconciler")
            .field("policy", &self.policy)
            .field("replicated", &self.replicated)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncReconciler {
    pub fn new(
        buffer: Arc<LocalWriteBuffer>,
        connections: Arc<ConnectionManager>,
        monitor: ConnectivityMonitor,
        policy: RetryPolicy,
        replicated: Vec<String>,
    ) -> Self {
        Self {
            buffer,
            connections,
            monitor,
            policy,
            replicated,
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            events: Listeners::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn on_event<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        self.events.on_event(callback)
    }

    /// Drain the active tenant's buffered writes.
    ///
    /// Safe to call redundantly: a call made while a pass is running returns
    /// at once with `coalesced` set, and the running call performs one more
    /// pass before returning.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            tracing::debug!("[Sync] Reconciliation already running; follow-up pass requested");
            return Ok(ReconcileReport::coalesced());
        }

        let mut total = ReconcileReport::default();
        loop {
            let outcome = {
                let _latch = Latch { flag: &self.running };
                self.rerun.store(false, Ordering::SeqCst);
                self.pass().await
            };
            let report = outcome?;
            let stop = report.cancelled || report.skipped_offline;
            total.absorb(report);

            if stop || !self.rerun.load(Ordering::SeqCst) {
                break;
            }
            if self.running.swap(true, Ordering::SeqCst) {
                // Another caller picked up the follow-up.
                break;
            }
        }
        Ok(total)
    }

    async fn pass(&self) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport {
            passes: 1,
            ..ReconcileReport::default()
        };
        if !self.monitor.is_online() {
            report.skipped_offline = true;
            return Ok(report);
        }
        let handle = self.connections.current().ok_or(SyncError::NoTenantConnection)?;
        let tenant = handle.tenant().clone();
        report.tenant = Some(tenant.clone());

        let released = self.buffer.release_claims(&tenant).await?;
        if released > 0 {
            tracing::warn!("[Sync] Released {} writes claimed by an interrupted pass", released);
        }

        let writes = self.buffer.drainable(&tenant).await?;
        if writes.is_empty() {
            self.refresh_replicated(&handle, &mut report).await?;
            return Ok(report);
        }

        tracing::info!("[Sync] Reconciling {} writes for {}", writes.len(), tenant);
        self.events.publish(SyncEvent::PassStarted { tenant: tenant.clone() });

        'collections: for (collection, queue) in group_by_collection(writes) {
            for write in queue {
                match self.apply_one(&handle, &write, &mut report).await? {
                    Step::Next => continue,
                    Step::StopCollection => {
                        tracing::debug!("[Sync] Holding {} until {} succeeds", collection, write.local_id);
                        break;
                    }
                    Step::EndPass => {
                        report.cancelled = true;
                        break 'collections;
                    }
                }
            }
        }

        if !report.cancelled {
            self.refresh_replicated(&handle, &mut report).await?;
        }

        if !report.dead_lettered.is_empty() {
            tracing::warn!(
                "[Sync] {} changes for {} could not be synced",
                report.dead_lettered.len(),
                tenant
            );
            self.events.publish(SyncEvent::SyncIncomplete {
                tenant,
                dead_lettered: report.dead_lettered.clone(),
            });
        }
        self.events.publish(SyncEvent::PassFinished(report.clone()));
        Ok(report)
    }

    async fn apply_one(
        &self,
        handle: &ConnectionHandle,
        write: &PendingWrite,
        report: &mut ReconcileReport,
    ) -> Result<Step, SyncError> {
        if !self.buffer.claim(write.local_id).await? {
            tracing::debug!("[Sync] {} could not be claimed, holding its collection", write.local_id);
            report.deferred += 1;
            return Ok(Step::StopCollection);
        }

        let error = match apply(handle, write).await {
            Ok(()) => {
                self.complete(write).await?;
                report.applied += 1;
                return Ok(Step::Next);
            }
            Err(AccessError::Store(e)) if is_idempotent_replay(write.op, &e) => {
                tracing::debug!("[Sync] {} already applied remotely ({})", write.local_id, e);
                self.complete(write).await?;
                report.replayed += 1;
                return Ok(Step::Next);
            }
            Err(AccessError::Cancelled) | Err(AccessError::HandleRevoked { .. }) => {
                self.buffer.release(write.local_id).await?;
                tracing::info!("[Sync] Handle closed mid-pass; {} released", write.local_id);
                return Ok(Step::EndPass);
            }
            Err(AccessError::Store(e)) => SyncError::classify(&e),
            Err(other) => SyncError::Transient {
                message: other.to_string(),
            },
        };

        let attempts = self.buffer.fail(write.local_id, &error.to_string()).await?;
        match error {
            SyncError::Permanent { message } => {
                self.buffer
                    .dead_letter(write.local_id, &message, FailureClass::Permanent)
                    .await?;
                report.dead_lettered.push(write.local_id);
                Ok(Step::Next)
            }
            _ if self.policy.exceeded(attempts) => {
                let reason = SyncError::RetryCeilingExceeded {
                    local_id: write.local_id,
                    attempts,
                }
                .to_string();
                self.buffer
                    .dead_letter(write.local_id, &reason, FailureClass::RetryCeilingExceeded)
                    .await?;
                report.dead_lettered.push(write.local_id);
                Ok(Step::Next)
            }
            other => {
                tracing::debug!("[Sync] {} attempt {} failed: {}", write.local_id, attempts, other);
                report.deferred += 1;
                Ok(Step::StopCollection)
            }
        }
    }

    async fn complete(&self, write: &PendingWrite) -> Result<(), SyncError> {
        self.buffer.ack(write.local_id).await?;
        self.buffer
            .advance_cursor(&write.tenant_id, &write.collection, Utc::now())
            .await?;
        Ok(())
    }

    /// Re-fetch replicated collections that have nothing left to push
    async fn refresh_replicated(&self, handle: &ConnectionHandle, report: &mut ReconcileReport) -> Result<(), SyncError> {
        let tenant = handle.tenant();
        for collection in &self.replicated {
            if self.buffer.has_pending(tenant, collection).await? {
                continue;
            }
            let name = collection.clone();
            match handle.run(|store| async move { store.list(&name, None).await }).await {
                Ok(records) => {
                    self.buffer.cache_replace(tenant, collection, &records).await?;
                    self.buffer.advance_cursor(tenant, collection, Utc::now()).await?;
                    report.refreshed.push(collection.clone());
                }
                Err(AccessError::Cancelled) | Err(AccessError::HandleRevoked { .. }) => break,
                Err(e) => tracing::debug!("[Sync] Could not refresh {}: {}", collection, e),
            }
        }
        Ok(())
    }
}

/// Apply one buffered write through the handle
async fn apply(handle: &ConnectionHandle, write: &PendingWrite) -> Result<(), AccessError> {
    let collection = write.collection.clone();
    let id = write.record_id.clone();
    let payload = write.payload.clone().unwrap_or_else(|| serde_json::json!({}));
    match write.op {
        WriteOp::Create => {
            handle
                .run(|store| async move { store.create(&collection, &id, payload).await.map(|_| ()) })
                .await
        }
        WriteOp::Update => {
            handle
                .run(|store| async move { store.update(&collection, &id, payload).await.map(|_| ()) })
                .await
        }
        WriteOp::Delete => {
            handle
                .run(|store| async move { store.delete(&collection, &id).await })
                .await
        }
    }
}

fn is_idempotent_replay(op: WriteOp, err: &StoreError) -> bool {
    matches!(
        (op, err),
        (WriteOp::Create, StoreError::AlreadyExists { .. }) | (WriteOp::Delete, StoreError::NotFound { .. })
    )
}

/// Split writes into per-collection queues, ordered by each collection's
/// oldest write
fn group_by_collection(writes: Vec<PendingWrite>) -> Vec<(String, Vec<PendingWrite>)> {
    let mut groups: Vec<(String, Vec<PendingWrite>)> = Vec::new();
    for write in writes {
        match groups.iter_mut().find(|(name, _)| *name == write.collection) {
            Some((_, queue)) => queue.push(write),
            None => groups.push((write.collection.clone(), vec![write])),
        }
    }
    groups
}
