//! # Document Store Abstraction
//!
//! The remote document store protocol is an opaque dependency of the layer.
//! Both planes are reached through the same [`DocumentStore`] trait:
//!
//! - `http.rs`: JSON-over-HTTP client with a Server-Sent Events change feed
//! - `memory.rs`: in-process store for local development and tests
//!
//! A [`StoreConnector`] turns a tenant descriptor into a live data-plane
//! store; only the connection manager calls it.

pub mod http;
pub mod memory;

pub use http::{HttpConnector, HttpDocumentStore};
pub use memory::{InMemoryDocumentStore, MemoryConnector, WriteLogEntry};

use crate::shared::{ChangeEvent, Filter, Payload, Record, StoreError};
use crate::tenant::ConnectionDescriptor;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt::Debug;
use std::sync::Arc;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Live change feed for one collection
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Record CRUD and change feed over named collections
#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    /// Fetch one record, `None` if absent
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>>;

    /// List records, optionally filtered
    async fn list(&self, collection: &str, filter: Option<&Filter>) -> StoreResult<Vec<Record>>;

    /// Create a record under a caller-chosen id.
    ///
    /// Fails with `AlreadyExists` if the id is taken, which makes replays of
    /// a buffered create detectable.
    async fn create(&self, collection: &str, id: &str, payload: Payload) -> StoreResult<Record>;

    /// Merge `patch` into an existing record
    async fn update(&self, collection: &str, id: &str, patch: Payload) -> StoreResult<Record>;

    /// Remove a record
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    /// Open a live change feed for a collection
    async fn watch(&self, collection: &str) -> StoreResult<ChangeStream>;

    /// Attach (or clear) the bearer identity used for subsequent requests
    fn authorize(&self, _token: Option<&str>) {}
}

/// Opens data-plane stores from tenant descriptors
#[async_trait]
pub trait StoreConnector: Send + Sync + Debug {
    /// Perform the handshake and return a ready store
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> StoreResult<Arc<dyn DocumentStore>>;
}
