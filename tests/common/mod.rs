//! Common test utilities
//!
//! Builds a [`TenantRuntime`] over in-process backends:
//!
//! - control plane: one `InMemoryDocumentStore` holding the `profiles`
//! - data planes: a `MemoryConnector`, one store per tenant
//! - identity: a `LocalIdentityProvider` with the accounts below
//!
//! | username | principal | password |
//! |----------|-----------|----------|
//! | ada      | u-ada     | pw       |
//! | bob      | u-bob     | pw       |

#![allow(dead_code)]

#[macro_use]
pub mod assertions;

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tenantlink::connectivity::ConnectivityMonitor;
use tenantlink::local_db::LocalDatabase;
use tenantlink::runtime::TenantRuntime;
use tenantlink::session::{Credentials, LocalIdentityProvider};
use tenantlink::shared::LayerConfig;
use tenantlink::store::{InMemoryDocumentStore, MemoryConnector};
use tenantlink::tenant::{ConnectionDescriptor, TenantId};

pub const RETRY_CEILING: u32 = 5;

/// Layer configuration used by every suite
pub fn config() -> LayerConfig {
    LayerConfig::builder()
        .replicate("orders")
        .replicate("customers")
        .handshake_timeout(Duration::from_secs(1))
        .drain_timeout(Duration::from_millis(200))
        .connectivity_hysteresis(Duration::ZERO)
        .retry_ceiling(RETRY_CEILING)
        .retry_delays(Duration::from_millis(10), Duration::from_millis(50))
        .build()
        .expect("test config is valid")
}

pub fn tenant(project: &str) -> TenantId {
    ConnectionDescriptor::new("ep", project, "key").tenant_id()
}

pub fn ada() -> Credentials {
    Credentials::new("ada", "pw")
}

pub fn bob() -> Credentials {
    Credentials::new("bob", "pw")
}

/// Backends shared across runtimes, so a test can restart the layer
#[derive(Clone)]
pub struct Backends {
    pub control: Arc<InMemoryDocumentStore>,
    pub connector: Arc<MemoryConnector>,
    pub identity: Arc<LocalIdentityProvider>,
}

impl Backends {
    pub fn new() -> Self {
        let identity = LocalIdentityProvider::new("integration-secret").with_cost(4);
        identity.add_account("ada", "u-ada", "pw").expect("hash password");
        identity.add_account("bob", "u-bob", "pw").expect("hash password");
        Self {
            control: Arc::new(InMemoryDocumentStore::new("control")),
            connector: Arc::new(MemoryConnector::new()),
            identity: Arc::new(identity),
        }
    }

    /// Point `principal` at the data plane of `project`
    pub async fn provision(&self, principal: &str, project: &str) {
        use tenantlink::store::DocumentStore;
        let profile = json!({
            "role": "member",
            "tenant_descriptor": {"endpoint_id": "ep", "project_id": project, "api_key": "key"}
        });
        if self.control.get("profiles", principal).await.expect("control read").is_some() {
            self.control
                .update("profiles", principal, profile)
                .await
                .expect("update profile");
        } else {
            self.control
                .create("profiles", principal, profile)
                .await
                .expect("create profile");
        }
    }

    pub fn remote(&self, project: &str) -> Arc<InMemoryDocumentStore> {
        self.connector.store_for(&tenant(project))
    }
}

/// A runtime plus handles on everything behind it
pub struct Harness {
    pub runtime: TenantRuntime,
    pub backends: Backends,
    pub monitor: ConnectivityMonitor,
}

impl Harness {
    /// Fresh backends, in-memory local database, online
    pub async fn new() -> Self {
        let database = LocalDatabase::in_memory().await.expect("in-memory database");
        Self::build(Backends::new(), database, true).await
    }

    /// Reuse `backends`, with the local database at `path`
    pub async fn at_path(backends: Backends, path: &Path, online: bool) -> Self {
        let database = LocalDatabase::open(path).await.expect("open local database");
        Self::build(backends, database, online).await
    }

    pub async fn build(backends: Backends, database: LocalDatabase, online: bool) -> Self {
        let monitor = ConnectivityMonitor::new(online, Duration::ZERO);
        let runtime = TenantRuntime::builder(config())
            .identity_provider(backends.identity.clone())
            .control_store(backends.control.clone())
            .connector(backends.connector.clone())
            .database(database)
            .monitor(monitor.clone())
            .build()
            .await
            .expect("build runtime");
        Self {
            runtime,
            backends,
            monitor,
        }
    }

    pub fn go_offline(&self) {
        self.monitor.report(false);
    }

    pub fn go_online(&self) {
        self.monitor.report(true);
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
