//! Connection Module
//!
//! The data-plane connection lifecycle:
//!
//! - `manager.rs`: the single-connection state machine
//! - `handle.rs`: revocable handles through which all data-plane work runs
//! - `subscriptions.rs`: per-handle live subscriptions with synchronous
//!   cancellation

pub mod handle;
pub mod manager;
pub mod subscriptions;

pub use handle::ConnectionHandle;
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use subscriptions::{ChangeCallback, SubscriptionId, SubscriptionRegistry};
