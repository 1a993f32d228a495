//! Access Module
//!
//! Plane-aware entity access for application code. See `gateway.rs`.

pub mod gateway;

pub use gateway::{EntityGateway, Subscription, WriteOutcome};
