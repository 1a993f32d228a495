//! # Background Sync Service
//!
//! Decides *when* to reconcile; `offline::reconciliation` decides *how*.
//!
//! ## Triggers
//!
//! - **Back online**: a published `online` transition
//! - **Connection opened**: a tenant connection became active (including
//!   after a re-bootstrap)
//! - **Backoff timer**: a cycle left writes deferred or failed outright;
//!   the next attempt follows the retry policy's exponential delay
//! - **Startup**: one cycle right after `start`, so writes left over from a
//!   previous run are drained
//!
//! A trigger only runs a pass when the active tenant has pending writes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tenantlink::sync::SyncService;
//! # use std::sync::Arc;
//! # async fn example(
//! #     reconciler: Arc<tenantlink::offline::SyncReconciler>,
//! #     buffer: Arc<tenantlink::offline::LocalWriteBuffer>,
//! #     connections: Arc<tenantlink::connection::ConnectionManager>,
//! #     monitor: tenantlink::connectivity::ConnectivityMonitor,
//! # ) -> Result<(), tenantlink::shared::SyncError> {
//! let service = SyncService::new(reconciler, buffer, connections, monitor);
//! service.start();
//!
//! let status = service.status().await?;
//! println!("{} writes waiting", status.pending);
//!
//! // Force an immediate pass
//! service.force_sync().await?;
//! # Ok(())
//! # }
//! ```

pub mod metrics;
pub mod sync_state;

pub use metrics::SyncMetrics;
pub use sync_state::{SyncState, SyncStatus};

use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::offline::{LocalWriteBuffer, ReconcileReport, SyncReconciler};
use crate::shared::SyncError;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Everything one cycle needs, shared with the background task
#[derive(Clone)]
struct SyncWorker {
    reconciler: Arc<SyncReconciler>,
    buffer: Arc<LocalWriteBuffer>,
    connections: Arc<ConnectionManager>,
    monitor: ConnectivityMonitor,
    state: Arc<Mutex<SyncState>>,
    metrics: Arc<Mutex<SyncMetrics>>,
}

/// Background reconciliation driver
pub struct SyncService {
    worker: SyncWorker,
    background_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("running", &self.is_running())
            .field("state", &*lock(&self.worker.state))
            .finish()
    }
}

impl SyncService {
    pub fn new(
        reconciler: Arc<SyncReconciler>,
        buffer: Arc<LocalWriteBuffer>,
        connections: Arc<ConnectionManager>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        Self {
            worker: SyncWorker {
                reconciler,
                buffer,
                connections,
                monitor,
                state: Arc::new(Mutex::new(SyncState::default())),
                metrics: Arc::new(Mutex::new(SyncMetrics::new())),
            },
            background_task: Mutex::new(None),
        }
    }

    /// Start the background task.
    ///
    /// Returns `false` if it was already running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut background_task = lock(&self.background_task);
        if background_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        // Subscribe before spawning so no trigger is missed.
        let connectivity = self.worker.monitor.subscribe();
        let connections = self.worker.connections.subscribe();
        let worker = self.worker.clone();
        *background_task = Some(tokio::spawn(worker.run(connectivity, connections)));
        tracing::info!("[Sync] Background sync started");
        true
    }

    /// Stop the background task; a pass in progress is abandoned
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.background_task).take() {
            handle.abort();
            lock(&self.worker.state).is_syncing = false;
            tracing::info!("[Sync] Background sync stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.background_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Run one pass now, even if nothing is pending
    pub async fn force_sync(&self) -> Result<ReconcileReport, SyncError> {
        self.worker.reconcile().await
    }

    /// Current status for the active tenant
    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let worker = &self.worker;
        let tenant = worker.connections.current().map(|handle| handle.tenant().clone());
        let (pending, dead_letters) = match &tenant {
            Some(tenant) => (
                worker.buffer.pending_count(tenant).await?,
                worker.buffer.dead_letter_count(tenant).await?,
            ),
            None => (0, 0),
        };
        let state = lock(&worker.state).clone();
        Ok(SyncStatus {
            tenant,
            syncing: state.is_syncing,
            online: worker.monitor.is_online(),
            last_sync: state.last_sync,
            last_error: state.last_error,
            pending,
            dead_letters,
            incomplete: state.incomplete,
        })
    }

    /// Clear the `incomplete` flag once the dead letters have been seen
    pub fn acknowledge_incomplete(&self) {
        lock(&self.worker.state).incomplete = false;
    }

    pub fn metrics(&self) -> SyncMetrics {
        lock(&self.worker.metrics).clone()
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.background_task).take() {
            handle.abort();
        }
    }
}

impl SyncWorker {
    async fn run(
        self,
        mut connectivity: UnboundedReceiver<Connectivity>,
        mut connections: UnboundedReceiver<ConnectionEvent>,
    ) {
        let mut retry_at = Some(Instant::now());
        loop {
            tokio::select! {
                Some(change) = connectivity.recv() => {
                    if !change.online {
                        continue;
                    }
                    tracing::debug!("[Sync] Online, checking buffer");
                }
                Some(event) = connections.recv() => {
                    let ConnectionEvent::Opened(handle) = event else {
                        continue;
                    };
                    tracing::debug!("[Sync] Connection opened for {}, checking buffer", handle.tenant());
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {}
                else => break,
            }
            retry_at = self.cycle().await.map(|delay| Instant::now() + delay);
        }
    }

    /// One triggered cycle; returns the delay before a retry, if one is due
    async fn cycle(&self) -> Option<Duration> {
        let Some(handle) = self.connections.current() else {
            return None;
        };
        if !self.monitor.is_online() {
            return None;
        }
        match self.buffer.pending_count(handle.tenant()).await {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("[Sync] Could not read the write buffer: {}", e);
                return None;
            }
        }

        let failures = match self.reconcile().await {
            Ok(report) if report.coalesced || report.cancelled || report.skipped_offline => return None,
            Ok(report) if report.deferred == 0 => return None,
            Ok(report) => {
                tracing::debug!("[Sync] {} writes deferred, backing off", report.deferred);
                lock(&self.state).consecutive_failures
            }
            Err(SyncError::NoTenantConnection) => return None,
            Err(e) => {
                tracing::warn!("[Sync] Reconciliation failed: {}", e);
                lock(&self.state).consecutive_failures
            }
        };
        let delay = self.reconciler.policy().next_delay(failures);
        tracing::debug!("[Sync] Next attempt in {:?}", delay);
        Some(delay)
    }

    async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        lock(&self.state).is_syncing = true;
        lock(&self.metrics).record_sync_start();

        let result = self.reconciler.reconcile().await;

        let mut state = lock(&self.state);
        state.is_syncing = false;
        match &result {
            Ok(report) => {
                lock(&self.metrics).record_sync_success(
                    report.applied + report.replayed,
                    report.deferred,
                    report.dead_lettered.len(),
                );
                if report.deferred > 0 {
                    state.consecutive_failures += 1;
                } else if !report.coalesced && !report.skipped_offline {
                    state.consecutive_failures = 0;
                    state.last_sync = Some(Utc::now());
                    state.last_error = None;
                }
                if !report.dead_lettered.is_empty() {
                    state.incomplete = true;
                }
            }
            Err(e) => {
                lock(&self.metrics).record_sync_failure();
                state.consecutive_failures += 1;
                state.last_error = Some(e.to_string());
            }
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
