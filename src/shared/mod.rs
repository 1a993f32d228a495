//! Shared Module
//!
//! Types used by every component of the layer: record shapes, the error
//! taxonomy, configuration, and the listener fan-out that carries
//! lifecycle events between components.

/// Entity-agnostic record types
pub mod record;

/// Error types for every concern of the layer
pub mod error;

/// Layer configuration
pub mod config;

/// Ordered event fan-out
pub mod listeners;

/// Re-export commonly used types for convenience
pub use record::{merge_patch, ChangeEvent, ChangeKind, Filter, Payload, Plane, Record};
pub use error::{
    AccessError, AuthError, BufferError, ConnectError, ResolveError, StoreError, SyncError,
};
pub use config::{ConfigError, LayerConfig, LayerConfigBuilder};
pub use listeners::Listeners;
