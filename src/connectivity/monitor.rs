//! # Connectivity Monitor
//!
//! Turns raw online/offline signals into debounced transitions.
//!
//! ## Debounce
//!
//! A change is published immediately unless another transition was
//! published less than one hysteresis window ago. In that case a single
//! flush is scheduled for the end of the window, which publishes the raw
//! state at that moment if it still differs from the published one. So:
//!
//! - at most one transition is published per window
//! - a flap that returns to the published state inside the window is
//!   never published
//! - the final state after a burst is always published

use crate::shared::Listeners;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A published connectivity transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub online: bool,
    pub at: DateTime<Utc>,
}

struct MonitorState {
    published: bool,
    raw: bool,
    last_published_at: Option<Instant>,
    flush_scheduled: bool,
}

struct MonitorInner {
    state: Mutex<MonitorState>,
    hysteresis: Duration,
    listeners: Listeners<Connectivity>,
}

/// Debounced online/offline state shared by the whole layer
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("hysteresis", &self.inner.hysteresis)
            .finish()
    }
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, hysteresis: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(MonitorState {
                    published: initially_online,
                    raw: initially_online,
                    last_published_at: None,
                    flush_scheduled: false,
                }),
                hysteresis,
                listeners: Listeners::new(),
            }),
        }
    }

    /// The last published state
    pub fn is_online(&self) -> bool {
        lock(&self.inner.state).published
    }

    /// Feed a raw signal from the host.
    ///
    /// Must be called from within a tokio runtime.
    pub fn report(&self, online: bool) {
        let mut state = lock(&self.inner.state);
        state.raw = online;
        if online == state.published || state.flush_scheduled {
            return;
        }

        let now = Instant::now();
        match state.last_published_at {
            Some(at) if now < at + self.inner.hysteresis => {
                state.flush_scheduled = true;
                let deadline = at + self.inner.hysteresis;
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(flush_at(weak, deadline));
            }
            _ => publish(&self.inner, &mut state, now),
        }
    }

    /// Receive every published transition, in order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Connectivity> {
        self.inner.listeners.subscribe()
    }

    /// Invoke `callback` on every published transition
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Connectivity) + Send + Sync + 'static,
    {
        self.inner.listeners.on_event(callback)
    }
}

async fn flush_at(inner: Weak<MonitorInner>, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = lock(&inner.state);
    state.flush_scheduled = false;
    if state.raw != state.published {
        publish(&inner, &mut state, Instant::now());
    } else {
        tracing::debug!("[Connectivity] Flap suppressed, still {}", label(state.published));
    }
}

/// Publish under the state lock so transitions reach subscribers in order
fn publish(inner: &MonitorInner, state: &mut MonitorState, now: Instant) {
    state.published = state.raw;
    state.last_published_at = Some(now);
    tracing::info!("[Connectivity] Now {}", label(state.published));
    inner.listeners.publish(Connectivity {
        online: state.published,
        at: Utc::now(),
    });
}

fn label(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
