//! Connection handles
//!
//! A [`ConnectionHandle`] is the only way to reach a tenant's data plane.
//! Clones share one underlying connection. Once revoked, a handle refuses
//! every operation, requests still in flight resolve to
//! `AccessError::Cancelled`, and its subscriptions are gone.

use super::subscriptions::{ChangeCallback, SubscriptionId, SubscriptionRegistry};
use crate::shared::{AccessError, Filter};
use crate::store::{DocumentStore, StoreResult};
use crate::tenant::{ConnectionDescriptor, TenantId};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

struct HandleInner {
    id: u64,
    tenant: TenantId,
    descriptor: ConnectionDescriptor,
    store: Arc<dyn DocumentStore>,
    cancel: watch::Sender<bool>,
    revoked: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    subscriptions: SubscriptionRegistry,
}

/// Reference-counted handle to one live data-plane connection
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("tenant", &self.inner.tenant)
            .field("revoked", &self.is_revoked())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Counts one request as in flight for as long as it lives
struct InFlight<'a> {
    inner: &'a HandleInner,
}

impl<'a> InFlight<'a> {
    fn enter(inner: &'a HandleInner) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, descriptor: ConnectionDescriptor, store: Arc<dyn DocumentStore>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                id,
                tenant: descriptor.tenant_id(),
                descriptor,
                store,
                cancel,
                revoked: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                subscriptions: SubscriptionRegistry::new(),
            }),
        }
    }

    /// Monotonic handle id, unique per manager
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.inner.tenant
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.inner.descriptor
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same connection
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Run a store operation through this handle.
    ///
    /// Fails with `HandleRevoked` if the handle is already revoked and with
    /// `Cancelled` if it is revoked before the operation completes.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, AccessError>
    where
        F: FnOnce(Arc<dyn DocumentStore>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let _in_flight = InFlight::enter(&self.inner);
        if self.is_revoked() {
            return Err(AccessError::HandleRevoked {
                tenant: self.inner.tenant.clone(),
            });
        }

        let mut cancel = self.inner.cancel.subscribe();
        let cancelled = async move {
            loop {
                if *cancel.borrow_and_update() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    return;
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancelled => return Err(AccessError::Cancelled),
            result = op(Arc::clone(&self.inner.store)) => result,
        };

        // A response that lands after revocation belongs to a dead tenant
        // context and is dropped.
        if self.is_revoked() {
            return Err(AccessError::Cancelled);
        }
        result.map_err(AccessError::from)
    }

    /// Subscribe to changes in `collection`, optionally filtered
    pub async fn subscribe(
        &self,
        collection: &str,
        filter: Option<Filter>,
        callback: ChangeCallback,
    ) -> Result<SubscriptionId, AccessError> {
        let owned = collection.to_string();
        let feed = self.run(|store| async move { store.watch(&owned).await }).await?;
        let id = self
            .inner
            .subscriptions
            .insert(feed, filter, callback)
            .ok_or_else(|| AccessError::HandleRevoked {
                tenant: self.inner.tenant.clone(),
            })?;
        tracing::debug!("[Connection] {} subscribed to {} ({:?})", self.inner.tenant, collection, id);
        Ok(id)
    }

    /// Cancel a subscription made through this handle
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.cancel(id)
    }

    /// Revoke the handle: refuse new work, cancel in-flight requests and
    /// cancel every subscription before returning.
    ///
    /// Returns `false` if the handle was already revoked.
    pub(crate) fn revoke(&self) -> bool {
        if self.inner.revoked.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.cancel.send_replace(true);
        let cancelled = self.inner.subscriptions.close();
        tracing::info!(
            "[Connection] Revoked handle #{} for {} ({} subscriptions cancelled)",
            self.inner.id,
            self.inner.tenant,
            cancelled
        );
        true
    }

    /// Wait until no request is in flight; `false` on timeout
    pub(crate) async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.inner.drained.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}
