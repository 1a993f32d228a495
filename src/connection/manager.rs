//! # Data-Plane Connection Manager
//!
//! Owns at most one active tenant connection.
//!
//! ## State Machine
//!
//! ```text
//! NoConnection ──open──> Opening ──handshake ok──> Active
//!      ^                    │                        │
//!      └──── failed ────────┘        close / switch  │
//!      └──────────────────── Closing <───────────────┘
//! ```
//!
//! Transitions are serialized by a single async guard that is held until
//! the manager is back in `Active` or `NoConnection`. Switching tenants
//! revokes the old handle (cancelling its subscriptions and in-flight
//! requests) before the new handshake starts.
//!
//! `invalidate` is synchronous and does not take the guard: it bumps a
//! generation counter so that an `open` racing with it discards its result.

use super::handle::ConnectionHandle;
use crate::shared::{AccessError, ConnectError, Listeners};
use crate::store::StoreConnector;
use crate::tenant::{ConnectionDescriptor, TenantId};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Public view of the manager's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    NoConnection,
    Opening(TenantId),
    Active(TenantId),
    Closing(TenantId),
}

/// Connection lifecycle events
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Opened(ConnectionHandle),
    Closed { tenant: TenantId, handle_id: u64 },
    Failed { tenant: TenantId, error: ConnectError },
}

enum Phase {
    NoConnection,
    Opening(ConnectionDescriptor),
    Active(ConnectionHandle),
    Closing {
        closing: ConnectionHandle,
        next: Option<ConnectionDescriptor>,
    },
}

struct ManagerState {
    phase: Phase,
    generation: u64,
}

/// Lazily opens and guards the single tenant connection
pub struct ConnectionManager {
    connector: Arc<dyn StoreConnector>,
    state: Mutex<ManagerState>,
    transition: tokio::sync::Mutex<()>,
    handshake_timeout: Duration,
    drain_timeout: Duration,
    next_handle: AtomicU64,
    events: Listeners<ConnectionEvent>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// Resets a half-finished transition if the `open` future is dropped
struct TransitionReset<'a> {
    manager: &'a ConnectionManager,
    generation: u64,
    armed: bool,
}

impl Drop for TransitionReset<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let stale = {
            let mut state = self.manager.lock_state();
            if state.generation != self.generation {
                return;
            }
            match std::mem::replace(&mut state.phase, Phase::NoConnection) {
                Phase::Closing { closing, .. } => Some(closing),
                Phase::Opening(_) | Phase::NoConnection => None,
                active @ Phase::Active(_) => {
                    state.phase = active;
                    None
                }
            }
        };
        if let Some(handle) = stale {
            handle.revoke();
        }
        tracing::debug!("[Connection] Abandoned transition reset to NoConnection");
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn StoreConnector>, handshake_timeout: Duration, drain_timeout: Duration) -> Self {
        Self {
            connector,
            state: Mutex::new(ManagerState {
                phase: Phase::NoConnection,
                generation: 0,
            }),
            transition: tokio::sync::Mutex::new(()),
            handshake_timeout,
            drain_timeout,
            next_handle: AtomicU64::new(1),
            events: Listeners::new(),
        }
    }

    /// Open (or reuse) the connection for `descriptor`.
    ///
    /// Concurrent calls for the same descriptor all receive the same handle.
    /// A call for a different descriptor while a transition is in flight
    /// (an open, a switch, or a close still draining) fails with
    /// `TenantSwitchInProgress`. Opening a different descriptor
    /// while one is active closes the active one first.
    pub async fn open(&self, descriptor: ConnectionDescriptor) -> Result<ConnectionHandle, ConnectError> {
        descriptor.validate()?;

        if let Some(handle) = self.reuse_or_reject(&descriptor)? {
            return Ok(handle);
        }

        let _guard = self.transition.lock().await;

        if let Some(handle) = self.reuse_or_reject(&descriptor)? {
            return Ok(handle);
        }

        let tenant = descriptor.tenant_id();
        let (generation, previous) = {
            let mut state = self.lock_state();
            let previous = match std::mem::replace(&mut state.phase, Phase::NoConnection) {
                Phase::Active(handle) => {
                    state.phase = Phase::Closing {
                        closing: handle.clone(),
                        next: Some(descriptor.clone()),
                    };
                    Some(handle)
                }
                _ => {
                    state.phase = Phase::Opening(descriptor.clone());
                    None
                }
            };
            (state.generation, previous)
        };
        let mut reset = TransitionReset {
            manager: self,
            generation,
            armed: true,
        };

        if let Some(previous) = previous {
            tracing::info!("[Connection] Switching tenant {} -> {}", previous.tenant(), tenant);
            self.teardown(&previous).await;
            let mut state = self.lock_state();
            if state.generation != generation {
                reset.armed = false;
                drop(state);
                self.publish_failed(&tenant, ConnectError::Cancelled);
                return Err(ConnectError::Cancelled);
            }
            state.phase = Phase::Opening(descriptor.clone());
        }

        tracing::info!("[Connection] Opening {}", tenant);
        let outcome = tokio::time::timeout(self.handshake_timeout, self.connector.connect(&descriptor)).await;

        let result = {
            let mut state = self.lock_state();
            reset.armed = false;
            if state.generation != generation {
                // Invalidated mid-handshake: the new store is discarded.
                Err(ConnectError::Cancelled)
            } else {
                match outcome {
                    Ok(Ok(store)) => {
                        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
                        let handle = ConnectionHandle::new(id, descriptor, store);
                        state.phase = Phase::Active(handle.clone());
                        Ok(handle)
                    }
                    Ok(Err(e)) => {
                        state.phase = Phase::NoConnection;
                        Err(ConnectError::Handshake(e))
                    }
                    Err(_) => {
                        state.phase = Phase::NoConnection;
                        Err(ConnectError::HandshakeTimeout { tenant: tenant.clone() })
                    }
                }
            }
        };

        match &result {
            Ok(handle) => {
                tracing::info!("[Connection] Active {} (handle #{})", tenant, handle.id());
                self.events.publish(ConnectionEvent::Opened(handle.clone()));
            }
            Err(e) => {
                tracing::warn!("[Connection] Failed to open {}: {}", tenant, e);
                self.publish_failed(&tenant, e.clone());
            }
        }
        result
    }

    /// Close `handle` if it is the active connection.
    ///
    /// A stale handle is still revoked. Returns whether the active connection
    /// was closed.
    pub async fn close(&self, handle: &ConnectionHandle) -> bool {
        let _guard = self.transition.lock().await;
        let generation = {
            let mut state = self.lock_state();
            match &state.phase {
                Phase::Active(active) if active.same_as(handle) => {
                    state.phase = Phase::Closing {
                        closing: handle.clone(),
                        next: None,
                    };
                    Some(state.generation)
                }
                _ => None,
            }
        };
        let Some(generation) = generation else {
            handle.revoke();
            return false;
        };
        let mut reset = TransitionReset {
            manager: self,
            generation,
            armed: true,
        };
        self.teardown(handle).await;
        let mut state = self.lock_state();
        reset.armed = false;
        if state.generation == generation {
            state.phase = Phase::NoConnection;
        }
        true
    }

    /// Close whatever connection is active
    pub async fn close_active(&self) -> bool {
        match self.current() {
            Some(handle) => self.close(&handle).await,
            None => false,
        }
    }

    /// Synchronously drop the connection.
    ///
    /// Revokes the active handle (if any) before returning and makes any
    /// `open` in progress fail with `Cancelled`.
    pub fn invalidate(&self) {
        let revoked = {
            let mut state = self.lock_state();
            state.generation += 1;
            match std::mem::replace(&mut state.phase, Phase::NoConnection) {
                Phase::Active(handle) => Some(handle),
                Phase::Closing { closing, .. } => Some(closing),
                Phase::Opening(descriptor) => {
                    tracing::info!("[Connection] Cancelling open of {}", descriptor.tenant_id());
                    None
                }
                Phase::NoConnection => None,
            }
        };
        if let Some(handle) = revoked {
            if handle.revoke() {
                self.events.publish(ConnectionEvent::Closed {
                    tenant: handle.tenant().clone(),
                    handle_id: handle.id(),
                });
            }
        }
    }

    /// The active handle, if any
    pub fn current(&self) -> Option<ConnectionHandle> {
        match &self.lock_state().phase {
            Phase::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &self.lock_state().phase {
            Phase::NoConnection => ConnectionState::NoConnection,
            Phase::Opening(descriptor) => ConnectionState::Opening(descriptor.tenant_id()),
            Phase::Active(handle) => ConnectionState::Active(handle.tenant().clone()),
            Phase::Closing { closing, .. } => ConnectionState::Closing(closing.tenant().clone()),
        }
    }

    /// Run `op` against the active handle, or fail with `NoTenantConnection`
    pub async fn with_handle<T, F, Fut>(&self, op: F) -> Result<T, AccessError>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T, AccessError>>,
    {
        let handle = self.current().ok_or(AccessError::NoTenantConnection)?;
        op(handle).await
    }

    /// Receive connection lifecycle events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Invoke `callback` for each connection lifecycle event
    pub fn on_event<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        self.events.on_event(callback)
    }

    /// Fast path: reuse a matching active handle, or reject a conflicting
    /// in-flight transition. `None` means "take the guard".
    fn reuse_or_reject(&self, descriptor: &ConnectionDescriptor) -> Result<Option<ConnectionHandle>, ConnectError> {
        let state = self.lock_state();
        match &state.phase {
            Phase::Active(handle) if handle.descriptor() == descriptor => Ok(Some(handle.clone())),
            Phase::Opening(target)
            | Phase::Closing {
                next: Some(target), ..
            } if target != descriptor => Err(ConnectError::TenantSwitchInProgress {
                requested: descriptor.tenant_id(),
                in_flight: target.tenant_id(),
            }),
            Phase::Closing { closing, next: None } if closing.descriptor() != descriptor => {
                Err(ConnectError::TenantSwitchInProgress {
                    requested: descriptor.tenant_id(),
                    in_flight: closing.tenant().clone(),
                })
            }
            _ => Ok(None),
        }
    }

    async fn teardown(&self, handle: &ConnectionHandle) {
        handle.revoke();
        if !handle.wait_drained(self.drain_timeout).await {
            tracing::warn!(
                "[Connection] {} requests still in flight on {} after {:?}",
                handle.in_flight(),
                handle.tenant(),
                self.drain_timeout
            );
        }
        self.events.publish(ConnectionEvent::Closed {
            tenant: handle.tenant().clone(),
            handle_id: handle.id(),
        });
        tracing::info!("[Connection] Closed {} (handle #{})", handle.tenant(), handle.id());
    }

    fn publish_failed(&self, tenant: &TenantId, error: ConnectError) {
        self.events.publish(ConnectionEvent::Failed {
            tenant: tenant.clone(),
            error,
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConnector;
    use assert_matches::assert_matches;

    fn manager(connector: Arc<MemoryConnector>) -> ConnectionManager {
        ConnectionManager::new(connector, Duration::from_secs(1), Duration::from_millis(200))
    }

    fn tenant(project: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new("ep", project, "key")
    }

    #[tokio::test]
    async fn test_open_reuses_same_descriptor() {
        let connector = Arc::new(MemoryConnector::new());
        let manager = manager(connector.clone());

        let a = manager.open(tenant("acme")).await.unwrap();
        let b = manager.open(tenant("acme")).await.unwrap();
        assert!(a.same_as(&b));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Active(tenant("acme").tenant_id()));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected_before_handshake() {
        let connector = Arc::new(MemoryConnector::new());
        let manager = manager(connector.clone());
        let err = manager.open(ConnectionDescriptor::new("ep", "acme", "")).await.unwrap_err();
        assert_matches!(err, ConnectError::DescriptorInvalid { .. });
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_switch_revokes_previous_handle() {
        let manager = manager(Arc::new(MemoryConnector::new()));
        let a = manager.open(tenant("acme")).await.unwrap();
        let b = manager.open(tenant("globex")).await.unwrap();

        assert!(a.is_revoked());
        assert!(!b.is_revoked());
        assert!(a.id() < b.id());
        assert!(manager.current().unwrap().same_as(&b));
    }

    #[tokio::test]
    async fn test_nothing_from_previous_tenant_after_switch() {
        use crate::store::DocumentStore;

        let connector = Arc::new(MemoryConnector::new());
        let manager = manager(connector.clone());
        let a = manager.open(tenant("acme")).await.unwrap();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        a.subscribe(
            "orders",
            None,
            Arc::new(move |e: crate::shared::ChangeEvent| {
                let _ = seen_tx.send(e.record_id);
            }),
        )
        .await
        .unwrap();

        manager.open(tenant("globex")).await.unwrap();
        connector
            .store_for(&tenant("acme").tenant_id())
            .create("orders", "late", serde_json::json!({}))
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_millis(50), seen.recv()).await;
        assert!(matches!(delivered, Ok(None) | Err(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_handshake_delay(Duration::from_secs(5));
        let manager = manager(connector);

        let err = manager.open(tenant("acme")).await.unwrap_err();
        assert_matches!(err, ConnectError::HandshakeTimeout { .. });
        assert_eq!(manager.state(), ConnectionState::NoConnection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_descriptor_during_open_is_rejected() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_handshake_delay(Duration::from_millis(100));
        let manager = Arc::new(manager(connector));

        let opener = Arc::clone(&manager);
        let first = tokio::spawn(async move { opener.open(tenant("acme")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = manager.open(tenant("globex")).await.unwrap_err();
        assert_matches!(err, ConnectError::TenantSwitchInProgress { .. });
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_handshake_cancels_open() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_handshake_delay(Duration::from_millis(100));
        let manager = Arc::new(manager(connector));

        let opener = Arc::clone(&manager);
        let pending = tokio::spawn(async move { opener.open(tenant("acme")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.invalidate();

        assert_matches!(pending.await.unwrap(), Err(ConnectError::Cancelled));
        assert!(manager.current().is_none());
        assert_eq!(manager.state(), ConnectionState::NoConnection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_opens_share_one_handshake() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_handshake_delay(Duration::from_millis(100));
        let manager = manager(connector.clone());

        let (a, b) = tokio::join!(manager.open(tenant("acme")), manager.open(tenant("acme")));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.same_as(&b));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_different_descriptor_during_close_is_rejected() {
        use crate::store::DocumentStore;

        let connector = Arc::new(MemoryConnector::new());
        let manager = ConnectionManager::new(connector.clone(), Duration::from_secs(1), Duration::from_millis(300));
        let a = manager.open(tenant("acme")).await.unwrap();
        connector
            .store_for(&tenant("acme").tenant_id())
            .set_latency(Duration::from_secs(1));

        // Started but never driven again, so it holds the drain open.
        let request = a.run(|store| async move { store.get("orders", "o1").await });
        tokio::pin!(request);
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut request).await.is_err());
        assert_eq!(a.in_flight(), 1);

        let (closed, opened) = tokio::join!(manager.close(&a), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager.open(tenant("globex")).await
        });

        assert!(closed);
        assert_matches!(
            opened,
            Err(ConnectError::TenantSwitchInProgress { ref in_flight, .. }) if *in_flight == tenant("acme").tenant_id()
        );
        assert_eq!(manager.state(), ConnectionState::NoConnection);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscription_callback_may_invalidate() {
        use crate::store::DocumentStore;

        let connector = Arc::new(MemoryConnector::new());
        let manager = Arc::new(manager(connector.clone()));
        let a = manager.open(tenant("acme")).await.unwrap();

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&manager);
        a.subscribe(
            "orders",
            None,
            Arc::new(move |e: crate::shared::ChangeEvent| {
                if let Some(manager) = weak.upgrade() {
                    manager.invalidate();
                }
                let _ = seen_tx.send(e.record_id);
            }),
        )
        .await
        .unwrap();

        connector
            .store_for(&tenant("acme").tenant_id())
            .create("orders", "o1", serde_json::json!({}))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), seen.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("o1"));
        assert!(a.is_revoked());
        assert_eq!(a.subscription_count(), 0);
        assert_eq!(manager.state(), ConnectionState::NoConnection);
    }

    #[tokio::test]
    async fn test_close_and_stale_close() {
        let manager = manager(Arc::new(MemoryConnector::new()));
        let mut events = manager.subscribe();
        let a = manager.open(tenant("acme")).await.unwrap();

        assert!(manager.close(&a).await);
        assert!(a.is_revoked());
        assert!(!manager.close(&a).await);
        assert_eq!(manager.state(), ConnectionState::NoConnection);

        assert_matches!(events.recv().await, Some(ConnectionEvent::Opened(_)));
        assert_matches!(events.recv().await, Some(ConnectionEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_with_handle_requires_connection() {
        let manager = manager(Arc::new(MemoryConnector::new()));
        let err = manager
            .with_handle(|h| async move { Ok(h.id()) })
            .await
            .unwrap_err();
        assert_matches!(err, AccessError::NoTenantConnection);
    }
}
