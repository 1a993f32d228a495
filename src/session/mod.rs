//! # Session Module
//!
//! Authenticates principals against the identity service and owns the
//! single active session.
//!
//! ## Lifecycle
//!
//! - `sign_in` tears down any existing session first, then publishes
//!   `SignedIn` exactly once on success
//! - `sign_out` is synchronous: the data-plane connection is invalidated
//!   before it returns
//! - a session ends when its token expires: a timer armed at sign-in signs
//!   it out and publishes `Expired`, and a read that notices the expiry
//!   first does the same
//!
//! ## Epochs
//!
//! Every sign-out (and every expiry) bumps a counter. A sign-in remembers
//! the value it started under and gives up with `AuthError::Cancelled` if
//! it changed while the provider was answering, so a sign-out always wins
//! over a sign-in still in progress.

pub mod local;
pub mod provider;

pub use local::{Claims, LocalIdentityProvider};
pub use provider::{Credentials, HttpIdentityProvider, IdentityProvider, Session};

use crate::connection::ConnectionManager;
use crate::shared::{AuthError, Listeners};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Session lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn(Session),
    SignedOut { principal_id: String },
    Expired { principal_id: String },
}

struct SessionState {
    current: Option<Session>,
    epoch: u64,
}

struct SessionInner {
    provider: Arc<dyn IdentityProvider>,
    connections: Arc<ConnectionManager>,
    state: Mutex<SessionState>,
    events: Listeners<SessionEvent>,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// End the session started under `epoch`, or with `None` any session
    /// whose token has expired. Returns whether a session ended.
    fn expire(&self, epoch: Option<u64>) -> bool {
        let expired = {
            let mut state = self.lock();
            let due = match (&state.current, epoch) {
                (Some(_), Some(epoch)) => state.epoch == epoch,
                (Some(session), None) => session.is_expired(),
                (None, _) => false,
            };
            if !due {
                return false;
            }
            state.epoch += 1;
            let session = state.current.take();
            if let Some(session) = &session {
                self.events.publish(SessionEvent::Expired {
                    principal_id: session.principal_id.clone(),
                });
            }
            session
        };
        if let Some(session) = expired {
            tracing::info!("[Session] Session of {} expired", session.principal_id);
        }
        self.connections.invalidate();
        true
    }
}

/// Owns the active session
pub struct SessionManager {
    inner: Arc<SessionInner>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SessionManager")
            .field("provider", &self.inner.provider)
            .field("current", &state.current)
            .field("epoch", &state.epoch)
            .finish()
    }
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                provider,
                connections,
                state: Mutex::new(SessionState {
                    current: None,
                    epoch: 0,
                }),
                events: Listeners::new(),
            }),
            expiry: Mutex::new(None),
        }
    }

    /// Authenticate and make the result the active session
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        self.sign_in_tracked(credentials).await.map(|(session, _)| session)
    }

    /// Like `sign_in`, also returning the epoch the session belongs to
    pub(crate) async fn sign_in_tracked(&self, credentials: &Credentials) -> Result<(Session, u64), AuthError> {
        self.sign_out();
        let epoch = self.inner.lock().epoch;

        let session = self.inner.provider.authenticate(credentials).await?;
        {
            let mut state = self.inner.lock();
            if state.epoch != epoch {
                tracing::info!("[Session] Sign-in of {} cancelled by sign-out", session.principal_id);
                return Err(AuthError::Cancelled);
            }
            state.current = Some(session.clone());
            self.inner.events.publish(SessionEvent::SignedIn(session.clone()));
        }
        tracing::info!("[Session] Signed in {}", session.principal_id);
        self.arm_expiry(epoch, &session);
        Ok((session, epoch))
    }

    /// End the session and invalidate the data-plane connection.
    ///
    /// Returns whether a session was active.
    pub fn sign_out(&self) -> bool {
        if let Some(task) = lock(&self.expiry).take() {
            task.abort();
        }
        let previous = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            let previous = state.current.take();
            if let Some(session) = &previous {
                self.inner.events.publish(SessionEvent::SignedOut {
                    principal_id: session.principal_id.clone(),
                });
            }
            previous
        };
        self.inner.connections.invalidate();
        match previous {
            Some(session) => {
                tracing::info!("[Session] Signed out {}", session.principal_id);
                true
            }
            None => false,
        }
    }

    /// The active session, if any and not expired
    pub fn current_session(&self) -> Option<Session> {
        self.inner.expire(None);
        self.inner.lock().current.clone()
    }

    /// Whether the session started under `epoch` is still the active one
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        let state = self.inner.lock();
        state.epoch == epoch && state.current.is_some()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Invoke `callback` on every session change
    pub fn on_session_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_event(callback)
    }

    fn arm_expiry(&self, epoch: u64, session: &Session) {
        let delay = (session.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(Some(epoch));
            }
        });
        if let Some(previous) = lock(&self.expiry).replace(task) {
            previous.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.expiry).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::store::MemoryConnector;
    use crate::tenant::ConnectionDescriptor;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn manager(ttl: chrono::Duration) -> (SessionManager, Arc<ConnectionManager>) {
        let provider = LocalIdentityProvider::new("secret").with_cost(4).with_token_ttl(ttl);
        provider.add_account("ada", "u-1", "pw").unwrap();
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(MemoryConnector::new()),
            Duration::from_secs(1),
            Duration::from_millis(100),
        ));
        (SessionManager::new(Arc::new(provider), connections.clone()), connections)
    }

    #[tokio::test]
    async fn test_sign_in_publishes_once() {
        let (sessions, _) = manager(chrono::Duration::hours(1));
        let mut events = sessions.subscribe();

        let session = sessions.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        assert_eq!(sessions.current_session(), Some(session.clone()));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn(session));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_sign_in_publishes_nothing() {
        let (sessions, _) = manager(chrono::Duration::hours(1));
        let mut events = sessions.subscribe();
        assert_eq!(
            sessions.sign_in(&Credentials::new("ada", "wrong")).await,
            Err(AuthError::InvalidCredentials)
        );
        assert!(sessions.current_session().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sign_out_revokes_connection() {
        let (sessions, connections) = manager(chrono::Duration::hours(1));
        sessions.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let handle = connections
            .open(ConnectionDescriptor::new("ep", "acme", "k"))
            .await
            .unwrap();

        assert!(sessions.sign_out());
        assert!(handle.is_revoked());
        assert_eq!(connections.state(), ConnectionState::NoConnection);
        assert!(!sessions.sign_out());
    }

    #[tokio::test]
    async fn test_sign_in_replaces_previous_session() {
        let (sessions, _) = manager(chrono::Duration::hours(1));
        let mut events = sessions.subscribe();
        sessions.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        sessions.sign_in(&Credentials::new("ada", "pw")).await.unwrap();

        assert_matches!(events.try_recv(), Ok(SessionEvent::SignedIn(_)));
        assert_matches!(events.try_recv(), Ok(SessionEvent::SignedOut { .. }));
        assert_matches!(events.try_recv(), Ok(SessionEvent::SignedIn(_)));
    }

    #[tokio::test]
    async fn test_expired_session_is_absent() {
        let (sessions, _) = manager(chrono::Duration::seconds(-1));
        let mut events = sessions.subscribe();
        sessions.sign_in(&Credentials::new("ada", "pw")).await.unwrap();

        assert!(sessions.current_session().is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_matches!(events.try_recv(), Ok(SessionEvent::SignedIn(_)));
        assert_matches!(events.try_recv(), Ok(SessionEvent::Expired { principal_id }) if principal_id == "u-1");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expiry_timer_revokes_connection() {
        let (sessions, connections) = manager(chrono::Duration::milliseconds(200));
        let mut events = sessions.subscribe();
        sessions.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let handle = connections
            .open(ConnectionDescriptor::new("ep", "acme", "k"))
            .await
            .unwrap();

        let expired = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::Expired { principal_id }) = events.recv().await {
                    return principal_id;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(expired, "u-1");
        assert!(handle.is_revoked());
        assert_eq!(connections.state(), ConnectionState::NoConnection);
        assert!(sessions.current_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_during_authentication_wins() {
        #[derive(Debug)]
        struct Slow(LocalIdentityProvider);

        #[async_trait::async_trait]
        impl IdentityProvider for Slow {
            async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.0.authenticate(credentials).await
            }
        }

        let provider = LocalIdentityProvider::new("secret").with_cost(4);
        provider.add_account("ada", "u-1", "pw").unwrap();
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(MemoryConnector::new()),
            Duration::from_secs(1),
            Duration::from_millis(100),
        ));
        let sessions = SessionManager::new(Arc::new(Slow(provider)), connections);
        let mut events = sessions.subscribe();

        let creds = Credentials::new("ada", "pw");

        let (result, _) = tokio::join!(sessions.sign_in(&creds), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sessions.sign_out();
        });

        assert_eq!(result, Err(AuthError::Cancelled));
        assert!(sessions.current_session().is_none());
        assert!(events.try_recv().is_err());
    }
}
