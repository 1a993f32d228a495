//! Subscription registry
//!
//! Every live subscription is a forwarding task reading a change feed and
//! invoking a callback. Cancellation is synchronous: once `cancel` returns,
//! no callback for that subscription can start, and any callback already
//! running has finished. A callback may cancel its own subscription (or
//! sign out, which closes the registry); it then returns normally and no
//! further callback runs.

use crate::shared::{ChangeEvent, Filter};
use crate::store::ChangeStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Callback invoked for each matching change
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Identifies a subscription within its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

struct Entry {
    /// `true` while the subscription may deliver
    open: Arc<AtomicBool>,
    /// Held for the duration of each callback
    gate: Arc<Mutex<()>>,
    task: JoinHandle<()>,
}

impl Entry {
    fn cancel(self) {
        self.open.store(false, Ordering::Release);
        // From inside our own callback the gate is already held by this task.
        if tokio::task::try_id() != Some(self.task.id()) {
            drop(lock(&self.gate));
        }
        self.task.abort();
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SubscriptionId, Entry>,
    closed: bool,
}

/// Set of live subscriptions owned by one connection handle (or the
/// control-plane gateway)
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("SubscriptionRegistry")
            .field("live", &inner.entries.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start forwarding `feed` to `callback`.
    ///
    /// Returns `None` if the registry was already closed.
    pub fn insert(
        &self,
        feed: ChangeStream,
        filter: Option<Filter>,
        callback: ChangeCallback,
    ) -> Option<SubscriptionId> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return None;
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let open = Arc::new(AtomicBool::new(true));
        let gate = Arc::new(Mutex::new(()));
        let task_open = Arc::clone(&open);
        let task_gate = Arc::clone(&gate);
        let mut feed = feed;

        let task = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                let passes = match (&filter, &event.record) {
                    (Some(filter), Some(record)) => filter.matches(&record.data),
                    _ => true,
                };
                if !passes {
                    continue;
                }
                let _running = lock(&task_gate);
                if !task_open.load(Ordering::Acquire) {
                    break;
                }
                callback(event);
            }
        });

        inner.entries.insert(id, Entry { open, gate, task });
        Some(id)
    }

    /// Cancel one subscription; `false` if it was unknown
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        let entry = lock(&self.inner).entries.remove(&id);
        match entry {
            Some(entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription and refuse new ones
    pub fn close(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            inner.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            entry.cancel();
        }
        count
    }

    /// Cancel every subscription but keep accepting new ones
    pub fn clear(&self) -> usize {
        let entries: Vec<Entry> = lock(&self.inner).entries.drain().map(|(_, e)| e).collect();
        let count = entries.len();
        for entry in entries {
            entry.cancel();
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in inner.entries.drain() {
            entry.task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{ChangeKind, Record};
    use futures_util::stream;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn event(id: &str, status: &str) -> ChangeEvent {
        ChangeEvent {
            collection: "orders".to_string(),
            kind: ChangeKind::Created,
            record_id: id.to_string(),
            record: Some(Record::new(id, json!({"status": status}))),
        }
    }

    fn channel_feed() -> (mpsc::UnboundedSender<ChangeEvent>, ChangeStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) });
        (tx, feed.boxed())
    }

    #[tokio::test]
    async fn test_filter_and_delivery() {
        let registry = SubscriptionRegistry::new();
        let (tx, feed) = channel_feed();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        registry
            .insert(
                feed,
                Some(Filter::new().eq("status", "open")),
                Arc::new(move |e: ChangeEvent| {
                    let _ = seen_tx.send(e.record_id);
                }),
            )
            .unwrap();

        tx.send(event("o1", "closed")).unwrap();
        tx.send(event("o2", "open")).unwrap();
        assert_eq!(seen.recv().await.as_deref(), Some("o2"));
    }

    #[tokio::test]
    async fn test_no_delivery_after_cancel() {
        let registry = SubscriptionRegistry::new();
        let (tx, feed) = channel_feed();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let id = registry
            .insert(
                feed,
                None,
                Arc::new(move |e: ChangeEvent| {
                    let _ = seen_tx.send(e.record_id);
                }),
            )
            .unwrap();

        assert!(registry.cancel(id));
        assert!(!registry.cancel(id));
        let _ = tx.send(event("o1", "open"));
        let delivered = tokio::time::timeout(std::time::Duration::from_millis(50), seen.recv()).await;
        assert!(matches!(delivered, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_callback_can_cancel_itself() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, feed) = channel_feed();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::default();

        let callback_registry = Arc::downgrade(&registry);
        let callback_id = Arc::clone(&own_id);
        let id = registry
            .insert(
                feed,
                None,
                Arc::new(move |e: ChangeEvent| {
                    let id = *lock(&callback_id);
                    if let (Some(registry), Some(id)) = (callback_registry.upgrade(), id) {
                        registry.cancel(id);
                    }
                    let _ = seen_tx.send(e.record_id);
                }),
            )
            .unwrap();
        *lock(&own_id) = Some(id);

        tx.send(event("o1", "open")).unwrap();
        assert_eq!(seen.recv().await.as_deref(), Some("o1"));
        assert!(registry.is_empty());

        let _ = tx.send(event("o2", "open"));
        let delivered = tokio::time::timeout(std::time::Duration::from_millis(50), seen.recv()).await;
        assert!(matches!(delivered, Ok(None) | Err(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_can_close_registry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, feed) = channel_feed();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();

        let callback_registry = Arc::downgrade(&registry);
        registry
            .insert(
                feed,
                None,
                Arc::new(move |e: ChangeEvent| {
                    if let Some(registry) = callback_registry.upgrade() {
                        registry.close();
                    }
                    let _ = seen_tx.send(e.record_id);
                }),
            )
            .unwrap();

        tx.send(event("o1", "open")).unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_secs(2), seen.recv()).await;
        assert_eq!(first.unwrap().as_deref(), Some("o1"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_inserts() {
        let registry = SubscriptionRegistry::new();
        let (_tx, feed) = channel_feed();
        registry.insert(feed, None, Arc::new(|_| {})).unwrap();
        assert_eq!(registry.close(), 1);

        let (_tx2, feed2) = channel_feed();
        assert!(registry.insert(feed2, None, Arc::new(|_| {})).is_none());
        assert!(registry.is_empty());
    }
}
