//! # In-Memory Document Store
//!
//! A complete [`DocumentStore`] held in process memory. Used as the
//! loopback backend in development and as the remote side in tests, which
//! is why it carries fault injection (`fail_next`, `set_unreachable`),
//! artificial latency and a log of every applied write.

use super::{ChangeStream, DocumentStore, StoreConnector, StoreResult};
use crate::shared::{merge_patch, ChangeEvent, ChangeKind, Filter, Payload, Record, StoreError};
use crate::tenant::{ConnectionDescriptor, TenantId};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// A write the store actually applied
#[derive(Debug, Clone, PartialEq)]
pub struct WriteLogEntry {
    pub kind: ChangeKind,
    pub collection: String,
    pub record_id: String,
    /// Body after the write (`None` for deletions)
    pub payload: Option<Payload>,
}

/// Document store living in process memory
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    label: String,
    collections: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    changes: broadcast::Sender<ChangeEvent>,
    /// Errors returned by the next writes, in order
    faults: Mutex<VecDeque<StoreError>>,
    unreachable: AtomicBool,
    latency: Mutex<Duration>,
    log: Mutex<Vec<WriteLogEntry>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store; `label` shows up in logs
    pub fn new(label: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            label: label.into(),
            collections: RwLock::new(HashMap::new()),
            changes,
            faults: Mutex::new(VecDeque::new()),
            unreachable: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Insert a record directly, bypassing faults and the write log
    pub async fn insert(&self, collection: &str, record: Record) {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Make the next write fail with `err` (queued, one per call)
    pub fn fail_next(&self, err: StoreError) {
        lock(&self.faults).push_back(err);
    }

    /// Make every request fail with `Unavailable` until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every request by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Every write applied so far, in order
    pub fn write_log(&self) -> Vec<WriteLogEntry> {
        lock(&self.log).clone()
    }

    /// Snapshot of one collection
    pub async fn records(&self, collection: &str) -> Vec<Record> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open change feeds
    pub fn watcher_count(&self) -> usize {
        self.changes.receiver_count()
    }

    async fn gate(&self) -> StoreResult<()> {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(format!("{} unreachable", self.label)));
        }
        Ok(())
    }

    async fn gate_write(&self) -> StoreResult<()> {
        self.gate().await?;
        match lock(&self.faults).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record_write(&self, kind: ChangeKind, collection: &str, id: &str, record: Option<Record>) {
        lock(&self.log).push(WriteLogEntry {
            kind,
            collection: collection.to_string(),
            record_id: id.to_string(),
            payload: record.as_ref().map(|r| r.data.clone()),
        });
        // No watchers is fine.
        let _ = self.changes.send(ChangeEvent {
            collection: collection.to_string(),
            kind,
            record_id: id.to_string(),
            record,
        });
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        self.gate().await?;
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn list(&self, collection: &str, filter: Option<&Filter>) -> StoreResult<Vec<Record>> {
        self.gate().await?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| filter.map_or(true, |f| f.matches(&r.data)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, collection: &str, id: &str, payload: Payload) -> StoreResult<Record> {
        self.gate_write().await?;
        let record = {
            let mut collections = self.collections.write().await;
            let records = collections.entry(collection.to_string()).or_default();
            if records.contains_key(id) {
                return Err(StoreError::already_exists(collection, id));
            }
            let record = Record::new(id, payload);
            records.insert(id.to_string(), record.clone());
            record
        };
        self.record_write(ChangeKind::Created, collection, id, Some(record.clone()));
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, patch: Payload) -> StoreResult<Record> {
        self.gate_write().await?;
        let record = {
            let mut collections = self.collections.write().await;
            let existing = collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(id))
                .ok_or_else(|| StoreError::not_found(collection, id))?;
            existing.data = merge_patch(&existing.data, &patch);
            existing.updated_at = Utc::now();
            existing.clone()
        };
        self.record_write(ChangeKind::Updated, collection, id, Some(record.clone()));
        Ok(record)
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.gate_write().await?;
        {
            let mut collections = self.collections.write().await;
            collections
                .get_mut(collection)
                .and_then(|c| c.remove(id))
                .ok_or_else(|| StoreError::not_found(collection, id))?;
        }
        self.record_write(ChangeKind::Deleted, collection, id, None);
        Ok(())
    }

    async fn watch(&self, collection: &str) -> StoreResult<ChangeStream> {
        self.gate().await?;
        let rx = self.changes.subscribe();
        let collection = collection.to_string();
        let label = self.label.clone();
        let feed = stream::unfold(rx, move |mut rx| {
            let collection = collection.clone();
            let label = label.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.collection == collection => return Some((event, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("[MemoryStore] {} watcher lagged, skipped {} events", label, skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(feed.boxed())
    }
}

/// Connector handing out one in-memory store per tenant
#[derive(Debug, Default)]
pub struct MemoryConnector {
    stores: Mutex<HashMap<TenantId, Arc<InMemoryDocumentStore>>>,
    handshake_delay: Mutex<Duration>,
    refused: Mutex<HashSet<TenantId>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backing store for a tenant, created on first use
    pub fn store_for(&self, tenant: &TenantId) -> Arc<InMemoryDocumentStore> {
        let mut stores = lock(&self.stores);
        Arc::clone(
            stores
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(InMemoryDocumentStore::new(tenant.as_str()))),
        )
    }

    /// Delay every handshake by `delay`
    pub fn set_handshake_delay(&self, delay: Duration) {
        *lock(&self.handshake_delay) = delay;
    }

    /// Make handshakes for `tenant` fail
    pub fn refuse(&self, tenant: TenantId) {
        lock(&self.refused).insert(tenant);
    }

    /// Number of handshakes attempted
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> StoreResult<Arc<dyn DocumentStore>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.handshake_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let tenant = descriptor.tenant_id();
        if lock(&self.refused).contains(&tenant) {
            return Err(StoreError::rejected(format!("tenant {} refused handshake", tenant)));
        }
        let store: Arc<dyn DocumentStore> = self.store_for(&tenant);
        Ok(store)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let store = InMemoryDocumentStore::new("test");

        store.create("orders", "o1", json!({"qty": 1, "sku": "A"})).await.unwrap();
        let updated = store.update("orders", "o1", json!({"qty": 3})).await.unwrap();
        assert_eq!(updated.data, json!({"qty": 3, "sku": "A"}));

        let fetched = store.get("orders", "o1").await.unwrap().unwrap();
        assert_eq!(fetched.data, json!({"qty": 3, "sku": "A"}));

        store.delete("orders", "o1").await.unwrap();
        assert!(store.get("orders", "o1").await.unwrap().is_none());
        assert_eq!(store.write_log().len(), 3);
    }

    #[tokio::test]
    async fn test_create_duplicate_is_already_exists() {
        let store = InMemoryDocumentStore::new("test");
        store.create("orders", "o1", json!({})).await.unwrap();
        let err = store.create("orders", "o1", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryDocumentStore::new("test");
        let err = store.update("orders", "ghost", json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let store = InMemoryDocumentStore::new("test");
        store.create("orders", "o1", json!({"status": "open"})).await.unwrap();
        store.create("orders", "o2", json!({"status": "closed"})).await.unwrap();

        let open = store
            .list("orders", Some(&Filter::new().eq("status", "open")))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "o1");
        assert_eq!(store.list("orders", None).await.unwrap().len(), 2);
        assert!(store.list("nothing", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection_consumes_in_order() {
        let store = InMemoryDocumentStore::new("test");
        store.fail_next(StoreError::Timeout);

        let err = store.create("orders", "o1", json!({})).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout);
        assert!(store.create("orders", "o1", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let store = InMemoryDocumentStore::new("test");
        store.set_unreachable(true);
        assert!(store.get("orders", "o1").await.unwrap_err().is_transient());
        store.set_unreachable(false);
        assert!(store.get("orders", "o1").await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_filters_by_collection() {
        let store = InMemoryDocumentStore::new("test");
        let mut feed = store.watch("orders").await.unwrap();

        store.create("customers", "c1", json!({})).await.unwrap();
        store.create("orders", "o1", json!({"qty": 1})).await.unwrap();

        let event = feed.next().await.unwrap();
        assert_eq!(event.collection, "orders");
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.record_id, "o1");
    }

    #[tokio::test]
    async fn test_connector_reuses_store_per_tenant() {
        let connector = MemoryConnector::new();
        let descriptor = ConnectionDescriptor::new("ep", "acme", "key");

        connector.connect(&descriptor).await.unwrap();
        connector.connect(&descriptor).await.unwrap();
        assert_eq!(connector.connect_count(), 2);

        let backing = connector.store_for(&descriptor.tenant_id());
        backing.insert("orders", Record::new("o1", json!({}))).await;
        let store = connector.connect(&descriptor).await.unwrap();
        assert!(store.get("orders", "o1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_connector_refusal() {
        let connector = MemoryConnector::new();
        let descriptor = ConnectionDescriptor::new("ep", "acme", "key");
        connector.refuse(descriptor.tenant_id());
        let err = connector.connect(&descriptor).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
    }
}
