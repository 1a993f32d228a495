//! tenantlink - Tenant Routing and Offline Resilience
//!
//! A client-side layer that signs a principal in, discovers which tenant
//! project they belong to, keeps exactly one data-plane connection open for
//! that tenant, and keeps writes flowing while the network comes and goes.
//!
//! # Planes
//!
//! - **Control plane**: shared by every tenant; holds user profiles and the
//!   tenant descriptors that point at each data plane
//! - **Data plane**: one isolated project per tenant; holds business records
//!
//! # Module Structure
//!
//! - **`session`** - identity providers and the single active session
//! - **`tenant`** - tenant descriptors and the config resolver
//! - **`connection`** - the data-plane connection manager and handles
//! - **`connectivity`** - online/offline monitoring and the network probe
//! - **`offline`** - the durable local write buffer and the sync reconciler
//! - **`sync`** - background reconciliation scheduling
//! - **`access`** - the plane-aware entity gateway used by application code
//! - **`runtime`** - wires everything into one `TenantRuntime`
//! - **`store`** - the document store trait with HTTP and in-memory backends
//! - **`local_db`** - the SQLite database behind the write buffer
//! - **`shared`** - records, errors, configuration and event fan-out
//!
//! # Usage
//!
//! ```rust,no_run
//! use tenantlink::runtime::TenantRuntime;
//! use tenantlink::session::Credentials;
//! use tenantlink::shared::{LayerConfig, Plane};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = TenantRuntime::builder(LayerConfig::load(None)?).build().await?;
//! runtime.start()?;
//! runtime.sign_in(&Credentials::new("ada", "secret")).await?;
//!
//! // Queued locally if offline, synced once the network returns
//! runtime
//!     .gateway()
//!     .create(Plane::DataPlane, "orders", None, json!({"qty": 3}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod shared;

pub mod store;

pub mod tenant;

pub mod session;

pub mod connection;

pub mod connectivity;

pub mod local_db;

pub mod offline;

pub mod sync;

pub mod access;

pub mod runtime;

pub use runtime::{RuntimeError, TenantContext, TenantRuntime};
