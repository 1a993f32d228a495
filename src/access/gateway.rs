//! # Entity Gateway
//!
//! The single entry point for entity reads, writes and subscriptions.
//!
//! ## Routing
//!
//! - **Control plane**: passed straight to the control-plane store.
//! - **Data plane**: requires an active tenant connection. Without one the
//!   call fails with `NoTenantConnection` and nothing is sent anywhere.
//!
//! ## Data-Plane Writes
//!
//! A write is buffered when its collection is replicated, when the layer is
//! offline, or when the collection still has buffered writes (so a direct
//! write can never overtake them). Buffered writes are reflected in the
//! local cache at once and, when online, drained immediately. A direct
//! write that fails transiently falls back to the buffer.
//!
//! ## Data-Plane Reads
//!
//! Replicated collections are served from the cache while offline, after a
//! transient failure, or while they have buffered writes. Any other read
//! that cannot reach the remote fails with `AccessError::Offline`.

use crate::connection::{ConnectionHandle, ConnectionManager, SubscriptionId, SubscriptionRegistry};
use crate::connectivity::ConnectivityMonitor;
use crate::offline::{EnqueueOutcome, LocalWriteBuffer, NewWrite, SyncReconciler, WriteOp};
use crate::shared::{AccessError, ChangeEvent, Filter, Payload, Plane, Record};
use crate::store::DocumentStore;
use crate::tenant::TenantId;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// How a write was carried out
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Applied directly by the remote store; carries the stored record
    /// (`None` for deletions)
    Applied(Option<Record>),
    /// Buffered and already drained to the remote store
    Synced(EnqueueOutcome),
    /// Buffered; will be drained by a later pass
    Queued(EnqueueOutcome),
    /// Buffered, then rejected by the remote store and dead-lettered
    DeadLettered(EnqueueOutcome),
}

impl WriteOutcome {
    /// Whether the remote store has the write
    pub fn is_remote(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_) | WriteOutcome::Synced(_))
    }
}

/// A live subscription made through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub plane: Plane,
    pub id: SubscriptionId,
    /// Data-plane handle the subscription belongs to
    handle_id: Option<u64>,
}

/// Plane-aware entity access
pub struct EntityGateway {
    control: Arc<dyn DocumentStore>,
    control_subscriptions: SubscriptionRegistry,
    connections: Arc<ConnectionManager>,
    buffer: Arc<LocalWriteBuffer>,
    reconciler: Arc<SyncReconciler>,
    monitor: ConnectivityMonitor,
    replicated: HashSet<String>,
}

impl std::fmt::Debug for EntityGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGateway")
            .field("connection", &self.connections.state())
            .field("online", &self.monitor.is_online())
            .field("replicated", &self.replicated)
            .field("control_subscriptions", &self.control_subscriptions.len())
            .finish()
    }
}

impl EntityGateway {
    pub fn new(
        control: Arc<dyn DocumentStore>,
        connections: Arc<ConnectionManager>,
        buffer: Arc<LocalWriteBuffer>,
        reconciler: Arc<SyncReconciler>,
        monitor: ConnectivityMonitor,
        replicated: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            control,
            control_subscriptions: SubscriptionRegistry::new(),
            connections,
            buffer,
            reconciler,
            monitor,
            replicated: replicated.into_iter().collect(),
        }
    }

    pub fn is_replicated(&self, collection: &str) -> bool {
        self.replicated.contains(collection)
    }

    pub async fn get(&self, plane: Plane, collection: &str, id: &str) -> Result<Option<Record>, AccessError> {
        let handle = match plane {
            Plane::ControlPlane => return Ok(self.control.get(collection, id).await?),
            Plane::DataPlane => self.data_handle()?,
        };
        let tenant = handle.tenant().clone();
        if self.prefers_cache(&tenant, collection).await? {
            return self.cached_get(&tenant, collection, id).await;
        }

        let (name, key) = (collection.to_string(), id.to_string());
        match handle.run(|store| async move { store.get(&name, &key).await }).await {
            Ok(record) => {
                if self.is_replicated(collection) {
                    match &record {
                        Some(record) => self.buffer.cache_put(&tenant, collection, record).await?,
                        None => self.buffer.cache_remove(&tenant, collection, id).await?,
                    }
                }
                Ok(record)
            }
            Err(e) if e.is_transient() => {
                tracing::debug!("[Gateway] get {}/{} failed ({}), trying cache", collection, id, e);
                self.cached_get(&tenant, collection, id).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, plane: Plane, collection: &str, filter: Option<&Filter>) -> Result<Vec<Record>, AccessError> {
        let handle = match plane {
            Plane::ControlPlane => return Ok(self.control.list(collection, filter).await?),
            Plane::DataPlane => self.data_handle()?,
        };
        let tenant = handle.tenant().clone();
        if self.prefers_cache(&tenant, collection).await? {
            return self.cached_list(&tenant, collection, filter).await;
        }

        let name = collection.to_string();
        let owned = filter.cloned();
        let result = handle
            .run(|store| async move { store.list(&name, owned.as_ref()).await })
            .await;
        match result {
            Ok(records) => {
                if self.is_replicated(collection) {
                    if filter.map_or(true, Filter::is_empty) {
                        self.buffer.cache_replace(&tenant, collection, &records).await?;
                    } else {
                        for record in &records {
                            self.buffer.cache_put(&tenant, collection, record).await?;
                        }
                    }
                }
                Ok(records)
            }
            Err(e) if e.is_transient() => {
                tracing::debug!("[Gateway] list {} failed ({}), trying cache", collection, e);
                self.cached_list(&tenant, collection, filter).await
            }
            Err(e) => Err(e),
        }
    }

    /// Subscribe to changes in `collection`.
    ///
    /// Data-plane subscriptions end when their connection closes; control-
    /// plane subscriptions end on sign-out.
    pub async fn subscribe<F>(
        &self,
        plane: Plane,
        collection: &str,
        filter: Option<Filter>,
        callback: F,
    ) -> Result<Subscription, AccessError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        match plane {
            Plane::ControlPlane => {
                let feed = self.control.watch(collection).await?;
                let id = self
                    .control_subscriptions
                    .insert(feed, filter, Arc::new(callback))
                    .ok_or(AccessError::Cancelled)?;
                Ok(Subscription {
                    plane,
                    id,
                    handle_id: None,
                })
            }
            Plane::DataPlane => {
                let handle = self.data_handle()?;
                let id = handle.subscribe(collection, filter, Arc::new(callback)).await?;
                Ok(Subscription {
                    plane,
                    id,
                    handle_id: Some(handle.id()),
                })
            }
        }
    }

    /// Cancel a subscription; `false` if it had already ended
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        match subscription.plane {
            Plane::ControlPlane => self.control_subscriptions.cancel(subscription.id),
            Plane::DataPlane => match self.connections.current() {
                Some(handle) if Some(handle.id()) == subscription.handle_id => handle.unsubscribe(subscription.id),
                _ => false,
            },
        }
    }

    /// Cancel every control-plane subscription
    pub fn cancel_control_subscriptions(&self) -> usize {
        self.control_subscriptions.clear()
    }

    /// Create a record; a fresh UUID is used when `id` is `None`
    pub async fn create(
        &self,
        plane: Plane,
        collection: &str,
        id: Option<String>,
        payload: Payload,
    ) -> Result<WriteOutcome, AccessError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        match plane {
            Plane::ControlPlane => {
                let record = self.control.create(collection, &id, payload).await?;
                Ok(WriteOutcome::Applied(Some(record)))
            }
            Plane::DataPlane => {
                let handle = self.data_handle()?;
                let write = NewWrite::create(handle.tenant().clone(), collection, id, payload);
                self.write(&handle, write).await
            }
        }
    }

    /// Merge `patch` into an existing record
    pub async fn update(&self, plane: Plane, collection: &str, id: &str, patch: Payload) -> Result<WriteOutcome, AccessError> {
        match plane {
            Plane::ControlPlane => {
                let record = self.control.update(collection, id, patch).await?;
                Ok(WriteOutcome::Applied(Some(record)))
            }
            Plane::DataPlane => {
                let handle = self.data_handle()?;
                let write = NewWrite::update(handle.tenant().clone(), collection, id, patch);
                self.write(&handle, write).await
            }
        }
    }

    pub async fn delete(&self, plane: Plane, collection: &str, id: &str) -> Result<WriteOutcome, AccessError> {
        match plane {
            Plane::ControlPlane => {
                self.control.delete(collection, id).await?;
                Ok(WriteOutcome::Applied(None))
            }
            Plane::DataPlane => {
                let handle = self.data_handle()?;
                let write = NewWrite::delete(handle.tenant().clone(), collection, id);
                self.write(&handle, write).await
            }
        }
    }

    fn data_handle(&self) -> Result<ConnectionHandle, AccessError> {
        self.connections.current().ok_or(AccessError::NoTenantConnection)
    }

    async fn write(&self, handle: &ConnectionHandle, write: NewWrite) -> Result<WriteOutcome, AccessError> {
        let buffered = self.is_replicated(&write.collection)
            || !self.monitor.is_online()
            || self.buffer.has_pending(handle.tenant(), &write.collection).await?;

        if !buffered {
            match apply_direct(handle, &write).await {
                Ok(record) => return Ok(WriteOutcome::Applied(record)),
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "[Gateway] {} {}/{} failed ({}), buffering",
                        write.op,
                        write.collection,
                        write.record_id,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.buffer.apply_optimistic(&write).await?;
        let outcome = self.buffer.enqueue(write).await?;
        if !self.monitor.is_online() {
            return Ok(WriteOutcome::Queued(outcome));
        }

        if let Err(e) = self.reconciler.reconcile().await {
            tracing::debug!("[Gateway] Immediate drain failed: {}", e);
        }
        let local_id = outcome.local_id();
        if matches!(outcome, EnqueueOutcome::Annihilated(_)) {
            return Ok(WriteOutcome::Synced(outcome));
        }
        if self.buffer.is_dead_lettered(local_id).await? {
            return Ok(WriteOutcome::DeadLettered(outcome));
        }
        if self.buffer.is_pending(local_id).await? {
            return Ok(WriteOutcome::Queued(outcome));
        }
        Ok(WriteOutcome::Synced(outcome))
    }

    /// Replicated collections are read locally while offline or while they
    /// still have buffered writes
    async fn prefers_cache(&self, tenant: &TenantId, collection: &str) -> Result<bool, AccessError> {
        if !self.is_replicated(collection) {
            return Ok(false);
        }
        Ok(!self.monitor.is_online() || self.buffer.has_pending(tenant, collection).await?)
    }

    async fn cached_get(&self, tenant: &TenantId, collection: &str, id: &str) -> Result<Option<Record>, AccessError> {
        self.ensure_cached(tenant, collection).await?;
        Ok(self.buffer.cache_get(tenant, collection, id).await?)
    }

    async fn cached_list(
        &self,
        tenant: &TenantId,
        collection: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<Record>, AccessError> {
        self.ensure_cached(tenant, collection).await?;
        Ok(self.buffer.cache_list(tenant, collection, filter).await?)
    }

    async fn ensure_cached(&self, tenant: &TenantId, collection: &str) -> Result<(), AccessError> {
        if self.is_replicated(collection) && self.buffer.cache_has(tenant, collection).await? {
            return Ok(());
        }
        Err(AccessError::Offline {
            collection: collection.to_string(),
        })
    }
}

async fn apply_direct(handle: &ConnectionHandle, write: &NewWrite) -> Result<Option<Record>, AccessError> {
    let collection = write.collection.clone();
    let id = write.record_id.clone();
    let payload = write.payload.clone().unwrap_or(Payload::Null);
    match write.op {
        WriteOp::Create => {
            handle
                .run(|store| async move { store.create(&collection, &id, payload).await.map(Some) })
                .await
        }
        WriteOp::Update => {
            handle
                .run(|store| async move { store.update(&collection, &id, payload).await.map(Some) })
                .await
        }
        WriteOp::Delete => {
            handle
                .run(|store| async move { store.delete(&collection, &id).await.map(|_| None) })
                .await
        }
    }
}
