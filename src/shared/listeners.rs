//! Listener Fan-out
//!
//! Ordered, at-least-once event delivery used by the session manager,
//! the connectivity monitor, the connection manager and the reconciler.
//! Each subscriber owns an unbounded channel, so a slow subscriber never
//! drops events and never blocks the publisher.

use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A set of subscribers receiving clones of published events
#[derive(Debug)]
pub struct Listeners<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Register a callback driven by a spawned task.
    ///
    /// Must be called from within a tokio runtime. Aborting the returned
    /// handle unsubscribes.
    pub fn on_event<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event);
            }
        })
    }

    /// Deliver an event to every live subscriber, in subscription order.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: T) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    pub fn len(&self) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        // A poisoned list of senders is still a valid list of senders.
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone + Send + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}
