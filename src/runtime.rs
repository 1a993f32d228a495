//! # Tenant Runtime
//!
//! Wires every component together and drives the configuration flow:
//!
//! ```text
//! sign_in ──> authorize control plane ──> resolve ──> open data plane
//!                                            ^               │
//!                                            └── watch ──────┘ (re-bootstrap)
//! ```
//!
//! A descriptor change reported by the watch re-opens the connection for
//! the new descriptor (the old handle is revoked first). A descriptor that
//! disappears closes the connection. `sign_out` undoes everything
//! synchronously.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tenantlink::runtime::{TenantContext, TenantRuntime};
//! use tenantlink::session::Credentials;
//! use tenantlink::shared::{LayerConfig, Plane};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LayerConfig::load(None)?;
//! let runtime = TenantRuntime::builder(config).build().await?;
//! runtime.start()?;
//!
//! if let TenantContext::Connected(tenant) = runtime.sign_in(&Credentials::new("ada", "pw")).await? {
//!     println!("connected to {}", tenant);
//!     let orders = runtime.gateway().list(Plane::DataPlane, "orders", None).await?;
//!     println!("{} orders", orders.len());
//! }
//!
//! runtime.sign_out();
//! # Ok(())
//! # }
//! ```

use crate::access::EntityGateway;
use crate::connection::ConnectionManager;
use crate::connectivity::{ConnectivityMonitor, NetworkProbe};
use crate::local_db::LocalDatabase;
use crate::offline::{LocalWriteBuffer, RetryPolicy, SyncReconciler};
use crate::session::{Credentials, HttpIdentityProvider, IdentityProvider, SessionEvent, SessionManager};
use crate::shared::{
    AuthError, BufferError, ConfigError, ConnectError, LayerConfig, ResolveError, StoreError, SyncError,
};
use crate::store::{DocumentStore, HttpConnector, HttpDocumentStore, StoreConnector};
use crate::sync::{SyncService, SyncStatus};
use crate::tenant::{DescriptorWatch, Resolution, TenantConfigResolver, TenantId};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Where the configuration flow ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantContext {
    SignedOut,
    /// Signed in, but the principal has no tenant yet
    Unprovisioned,
    Connected(TenantId),
    /// Signed in, but the tenant descriptor is unusable
    Misconfigured(String),
}

/// Errors raised while building or driving the runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connectivity probe error: {0}")]
    Probe(#[from] reqwest::Error),
}

/// Builder for [`TenantRuntime`]; unset components are built from the
/// configuration
pub struct TenantRuntimeBuilder {
    config: LayerConfig,
    identity: Option<Arc<dyn IdentityProvider>>,
    control: Option<Arc<dyn DocumentStore>>,
    connector: Option<Arc<dyn StoreConnector>>,
    database: Option<LocalDatabase>,
    monitor: Option<ConnectivityMonitor>,
}

impl TenantRuntimeBuilder {
    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    pub fn control_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.control = Some(store);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn database(mut self, database: LocalDatabase) -> Self {
        self.database = Some(database);
        self
    }

    pub fn monitor(mut self, monitor: ConnectivityMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub async fn build(self) -> Result<TenantRuntime, RuntimeError> {
        let config = self.config;
        config.validate()?;

        let identity: Arc<dyn IdentityProvider> = match self.identity {
            Some(provider) => provider,
            None => {
                let url = config
                    .identity_url
                    .clone()
                    .ok_or(ConfigError::MissingValue("identity_url"))?;
                Arc::new(HttpIdentityProvider::new(url, config.request_timeout)?)
            }
        };
        let control: Arc<dyn DocumentStore> = match self.control {
            Some(store) => store,
            None => {
                let url = config
                    .control_plane_url
                    .clone()
                    .ok_or(ConfigError::MissingValue("control_plane_url"))?;
                Arc::new(HttpDocumentStore::new(
                    url,
                    &config.control_plane_project,
                    config.request_timeout,
                )?)
            }
        };
        let connector: Arc<dyn StoreConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HttpConnector::new(
                &config.data_plane_url_template,
                config.request_timeout,
            )?),
        };
        let database = match self.database {
            Some(database) => database,
            None => LocalDatabase::open(&config.local_db_path).await?,
        };
        let monitor = self
            .monitor
            .unwrap_or_else(|| ConnectivityMonitor::new(true, config.connectivity_hysteresis));

        let buffer = Arc::new(LocalWriteBuffer::open(database).await?);
        let connections = Arc::new(ConnectionManager::new(
            connector,
            config.handshake_timeout,
            config.drain_timeout,
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            buffer.clone(),
            connections.clone(),
            monitor.clone(),
            RetryPolicy::from_config(&config),
            config.replicated_collections.clone(),
        ));
        let gateway = Arc::new(EntityGateway::new(
            control.clone(),
            connections.clone(),
            buffer.clone(),
            reconciler.clone(),
            monitor.clone(),
            config.replicated_collections.clone(),
        ));
        let sync = SyncService::new(reconciler.clone(), buffer.clone(), connections.clone(), monitor.clone());
        let (context, _) = watch::channel(TenantContext::SignedOut);
        let sessions = Arc::new(SessionManager::new(identity, connections.clone()));

        Ok(TenantRuntime {
            resolver: TenantConfigResolver::new(control.clone(), config.profile_collection.clone()),
            bootstrap: Bootstrap {
                connections: connections.clone(),
                sessions: sessions.clone(),
                control: control.clone(),
                gateway: gateway.clone(),
                context: Arc::new(context),
            },
            sessions,
            config,
            control,
            connections,
            monitor,
            buffer,
            reconciler,
            gateway,
            sync,
            watch_task: Mutex::new(None),
            probe_task: Mutex::new(None),
        })
    }
}

/// Applies resolutions to the connection manager
#[derive(Clone)]
struct Bootstrap {
    connections: Arc<ConnectionManager>,
    sessions: Arc<SessionManager>,
    control: Arc<dyn DocumentStore>,
    gateway: Arc<EntityGateway>,
    context: Arc<watch::Sender<TenantContext>>,
}

impl Bootstrap {
    async fn apply(&self, resolution: Result<Resolution, ResolveError>) -> Result<TenantContext, RuntimeError> {
        let context = match resolution {
            Ok(Resolution::Provisioned(config)) => match self.connections.open(config.descriptor).await {
                Ok(handle) => TenantContext::Connected(handle.tenant().clone()),
                Err(ConnectError::DescriptorInvalid { message }) => {
                    self.connections.close_active().await;
                    TenantContext::Misconfigured(message)
                }
                Err(e) => return Err(e.into()),
            },
            Ok(Resolution::Unprovisioned) => {
                if self.connections.close_active().await {
                    tracing::info!("[Runtime] Tenant descriptor removed, connection closed");
                }
                TenantContext::Unprovisioned
            }
            Err(e @ (ResolveError::Incomplete { .. } | ResolveError::Malformed { .. })) => {
                self.connections.close_active().await;
                TenantContext::Misconfigured(e.to_string())
            }
            Err(e) => return Err(e.into()),
        };
        self.context.send_replace(context.clone());
        Ok(context)
    }

    /// Re-apply profile changes for the session started under `epoch`
    /// until it ends
    async fn follow(
        self,
        epoch: u64,
        mut watch: DescriptorWatch,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                resolution = watch.next() => {
                    let Some(resolution) = resolution else {
                        break;
                    };
                    if !self.sessions.is_current(epoch) {
                        break;
                    }
                    tracing::info!("[Runtime] Profile changed, re-bootstrapping");
                    if let Err(e) = self.apply(resolution).await {
                        tracing::warn!("[Runtime] Re-bootstrap failed: {}", e);
                    }
                    if !self.sessions.is_current(epoch) {
                        self.connections.invalidate();
                        self.context.send_replace(TenantContext::SignedOut);
                        break;
                    }
                }
                Some(event) = session_events.recv() => {
                    if let SessionEvent::Expired { principal_id } = event {
                        tracing::info!("[Runtime] Session of {} expired, signing out", principal_id);
                        self.control.authorize(None);
                        self.gateway.cancel_control_subscriptions();
                        self.context.send_replace(TenantContext::SignedOut);
                        break;
                    }
                }
            }
        }
    }
}

/// The assembled layer
pub struct TenantRuntime {
    config: LayerConfig,
    sessions: Arc<SessionManager>,
    resolver: TenantConfigResolver,
    bootstrap: Bootstrap,
    control: Arc<dyn DocumentStore>,
    connections: Arc<ConnectionManager>,
    monitor: ConnectivityMonitor,
    buffer: Arc<LocalWriteBuffer>,
    reconciler: Arc<SyncReconciler>,
    gateway: Arc<EntityGateway>,
    sync: SyncService,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TenantRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRuntime")
            .field("context", &self.context())
            .field("connection", &self.connections.state())
            .field("online", &self.monitor.is_online())
            .finish()
    }
}

impl TenantRuntime {
    pub fn builder(config: LayerConfig) -> TenantRuntimeBuilder {
        TenantRuntimeBuilder {
            config,
            identity: None,
            control: None,
            connector: None,
            database: None,
            monitor: None,
        }
    }

    /// Start background sync and, if configured, the connectivity probe.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), RuntimeError> {
        self.sync.start();
        if let Some(url) = &self.config.probe_url {
            let mut probe_task = lock(&self.probe_task);
            if probe_task.is_none() {
                let probe = NetworkProbe::new(url, self.config.probe_interval, self.config.request_timeout)?;
                *probe_task = Some(probe.spawn(self.monitor.clone()));
            }
        }
        Ok(())
    }

    /// Stop background work started by `start`
    pub fn stop(&self) {
        self.sync.stop();
        if let Some(task) = lock(&self.probe_task).take() {
            task.abort();
        }
    }

    /// Sign in and run the configuration flow.
    ///
    /// A `sign_out` that lands before this returns wins: the flow stops
    /// with `Cancelled` and leaves no connection behind.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<TenantContext, RuntimeError> {
        self.stop_watch();
        self.gateway.cancel_control_subscriptions();
        self.control.authorize(None);

        let (session, epoch) = self.sessions.sign_in_tracked(credentials).await?;
        let session_events = self.sessions.subscribe();
        self.ensure_current(epoch)?;
        self.control.authorize(Some(&session.identity_token));

        // Watch before resolving so no change between the two is missed.
        let watch = self.resolver.watch(&session.principal_id).await?;
        let resolution = self.resolver.resolve(&session.principal_id).await;
        self.ensure_current(epoch)?;
        let context = self.bootstrap.apply(resolution).await?;

        {
            let mut watch_task = lock(&self.watch_task);
            if self.sessions.is_current(epoch) {
                let follow = self.bootstrap.clone().follow(epoch, watch, session_events);
                *watch_task = Some(tokio::spawn(follow));
                return Ok(context);
            }
        }
        Err(self.abandon_sign_in())
    }

    /// Sign out, closing everything tied to the session before returning
    pub fn sign_out(&self) {
        self.sessions.sign_out();
        self.stop_watch();
        let cancelled = self.gateway.cancel_control_subscriptions();
        self.control.authorize(None);
        self.bootstrap.context.send_replace(TenantContext::SignedOut);
        tracing::info!("[Runtime] Signed out ({} control subscriptions cancelled)", cancelled);
    }

    pub fn context(&self) -> TenantContext {
        self.bootstrap.context.borrow().clone()
    }

    /// Follow context changes
    pub fn watch_context(&self) -> watch::Receiver<TenantContext> {
        self.bootstrap.context.subscribe()
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, SyncError> {
        self.sync.status().await
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn gateway(&self) -> &EntityGateway {
        &self.gateway
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn buffer(&self) -> &LocalWriteBuffer {
        &self.buffer
    }

    pub fn reconciler(&self) -> &SyncReconciler {
        &self.reconciler
    }

    /// Fail with `Cancelled` once the session started under `epoch` is gone
    fn ensure_current(&self, epoch: u64) -> Result<(), RuntimeError> {
        if self.sessions.is_current(epoch) {
            return Ok(());
        }
        Err(self.abandon_sign_in())
    }

    fn abandon_sign_in(&self) -> RuntimeError {
        tracing::info!("[Runtime] Sign-in superseded by sign-out, discarding it");
        if self.sessions.current_session().is_none() {
            self.connections.invalidate();
            self.control.authorize(None);
            self.bootstrap.context.send_replace(TenantContext::SignedOut);
        }
        ConnectError::Cancelled.into()
    }

    fn stop_watch(&self) {
        if let Some(task) = lock(&self.watch_task).take() {
            task.abort();
        }
    }
}

impl Drop for TenantRuntime {
    fn drop(&mut self) {
        self.stop_watch();
        if let Some(task) = lock(&self.probe_task).take() {
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
    use crate::session::LocalIdentityProvider;
    use crate::shared::Plane;
    use crate::store::{InMemoryDocumentStore, MemoryConnector};
    use crate::tenant::ConnectionDescriptor;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        runtime: TenantRuntime,
        control: Arc<InMemoryDocumentStore>,
        connector: Arc<MemoryConnector>,
    }

    async fn fixture() -> Fixture {
        fixture_with_ttl(chrono::Duration::hours(1)).await
    }

    async fn fixture_with_ttl(ttl: chrono::Duration) -> Fixture {
        let identity = LocalIdentityProvider::new("secret").with_cost(4).with_token_ttl(ttl);
        identity.add_account("ada", "u-1", "pw").unwrap();
        let control = Arc::new(InMemoryDocumentStore::new("control"));
        let connector = Arc::new(MemoryConnector::new());
        let config = LayerConfig::builder()
            .replicate("orders")
            .handshake_timeout(Duration::from_secs(1))
            .drain_timeout(Duration::from_millis(100))
            .connectivity_hysteresis(Duration::ZERO)
            .build()
            .unwrap();

        let runtime = TenantRuntime::builder(config)
            .identity_provider(Arc::new(identity))
            .control_store(control.clone())
            .connector(connector.clone())
            .database(LocalDatabase::in_memory().await.unwrap())
            .build()
            .await
            .unwrap();
        Fixture {
            runtime,
            control,
            connector,
        }
    }

    fn descriptor(project: &str) -> serde_json::Value {
        json!({"tenant_descriptor": {"endpoint_id": "ep", "project_id": project, "api_key": "k"}})
    }

    async fn wait_for(runtime: &TenantRuntime, expected: TenantContext) {
        let mut rx = runtime.watch_context();
        timeout(Duration::from_secs(2), rx.wait_for(|context| *context == expected))
            .await
            .expect("context never reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sign_in_connects_to_tenant() {
        let f = fixture().await;
        f.control.create("profiles", "u-1", descriptor("acme")).await.unwrap();

        let context = f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let tenant = ConnectionDescriptor::new("ep", "acme", "k").tenant_id();
        assert_eq!(context, TenantContext::Connected(tenant.clone()));
        assert_eq!(f.runtime.context(), context);
        assert_eq!(f.runtime.connections().state(), ConnectionState::Active(tenant));
    }

    #[tokio::test]
    async fn test_wrong_password_leaves_runtime_signed_out() {
        let f = fixture().await;
        assert_matches!(
            f.runtime.sign_in(&Credentials::new("ada", "nope")).await,
            Err(RuntimeError::Auth(AuthError::InvalidCredentials))
        );
        assert_eq!(f.runtime.context(), TenantContext::SignedOut);
        assert_eq!(f.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_unprovisioned_principal() {
        let f = fixture().await;
        let context = f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        assert_eq!(context, TenantContext::Unprovisioned);
        assert_eq!(f.runtime.connections().state(), ConnectionState::NoConnection);
        assert_matches!(
            f.runtime.gateway().list(Plane::DataPlane, "orders", None).await,
            Err(crate::shared::AccessError::NoTenantConnection)
        );
    }

    #[tokio::test]
    async fn test_incomplete_descriptor_is_misconfigured() {
        let f = fixture().await;
        f.control
            .create("profiles", "u-1", json!({"tenant_descriptor": {"endpoint_id": "ep"}}))
            .await
            .unwrap();

        let context = f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        assert_matches!(context, TenantContext::Misconfigured(message) if message.contains("project_id"));
        assert_eq!(f.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_descriptor_change_rebootstraps() {
        let f = fixture().await;
        f.control.create("profiles", "u-1", descriptor("acme")).await.unwrap();
        f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let old = f.runtime.connections().current().unwrap();

        f.control.update("profiles", "u-1", descriptor("globex")).await.unwrap();

        let globex = ConnectionDescriptor::new("ep", "globex", "k").tenant_id();
        wait_for(&f.runtime, TenantContext::Connected(globex.clone())).await;
        assert!(old.is_revoked());
        assert_eq!(f.runtime.connections().current().unwrap().tenant(), &globex);
    }

    #[tokio::test]
    async fn test_deleted_profile_closes_connection() {
        let f = fixture().await;
        f.control.create("profiles", "u-1", descriptor("acme")).await.unwrap();
        f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let handle = f.runtime.connections().current().unwrap();

        f.control.delete("profiles", "u-1").await.unwrap();

        wait_for(&f.runtime, TenantContext::Unprovisioned).await;
        assert!(handle.is_revoked());
        assert_eq!(f.runtime.connections().state(), ConnectionState::NoConnection);
    }

    #[tokio::test]
    async fn test_sign_out_revokes_everything() {
        let f = fixture().await;
        f.control.create("profiles", "u-1", descriptor("acme")).await.unwrap();
        f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let handle = f.runtime.connections().current().unwrap();

        f.runtime.sign_out();

        assert!(handle.is_revoked());
        assert_eq!(f.runtime.context(), TenantContext::SignedOut);
        assert!(f.runtime.sessions().current_session().is_none());
        assert_eq!(f.runtime.connections().state(), ConnectionState::NoConnection);

        // Profile changes after sign-out no longer reconnect.
        f.control.update("profiles", "u-1", descriptor("globex")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.runtime.context(), TenantContext::SignedOut);
        assert_eq!(f.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_during_sign_in_wins() {
        let f = fixture().await;
        f.control.create("profiles", "u-1", descriptor("acme")).await.unwrap();
        f.control.set_latency(Duration::from_millis(200));

        let creds = Credentials::new("ada", "pw");

        let (result, _) = tokio::join!(f.runtime.sign_in(&creds), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.runtime.sign_out();
        });

        assert_matches!(result, Err(RuntimeError::Connect(ConnectError::Cancelled)));
        assert!(f.runtime.sessions().current_session().is_none());
        assert_eq!(f.runtime.connections().state(), ConnectionState::NoConnection);
        assert_eq!(f.runtime.context(), TenantContext::SignedOut);
        assert_eq!(f.connector.connect_count(), 0);

        // No watch outlives the abandoned sign-in.
        f.control.set_latency(Duration::ZERO);
        f.control.update("profiles", "u-1", descriptor("globex")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_closes_data_plane() {
        let f = fixture_with_ttl(chrono::Duration::milliseconds(300)).await;
        f.control.create("profiles", "u-1", descriptor("acme")).await.unwrap();
        f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let handle = f.runtime.connections().current().unwrap();

        wait_for(&f.runtime, TenantContext::SignedOut).await;

        assert!(handle.is_revoked());
        assert_eq!(f.runtime.connections().state(), ConnectionState::NoConnection);
        assert_matches!(
            f.runtime
                .gateway()
                .create(Plane::DataPlane, "invoices", Some("i1".to_string()), json!({}))
                .await,
            Err(crate::shared::AccessError::NoTenantConnection)
        );
        let tenant = ConnectionDescriptor::new("ep", "acme", "k").tenant_id();
        assert!(f.connector.store_for(&tenant).records("invoices").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscription_callback_may_sign_out() {
        let f = fixture().await;
        f.control.create("profiles", "u-1", descriptor("acme")).await.unwrap();
        f.runtime.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        let runtime = Arc::new(f.runtime);

        let (done_tx, mut done) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&runtime);
        runtime
            .gateway()
            .subscribe(Plane::DataPlane, "invoices", None, move |_| {
                if let Some(runtime) = weak.upgrade() {
                    runtime.sign_out();
                }
                let _ = done_tx.send(());
            })
            .await
            .unwrap();

        let tenant = ConnectionDescriptor::new("ep", "acme", "k").tenant_id();
        f.connector
            .store_for(&tenant)
            .create("invoices", "i1", json!({}))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), done.recv()).await.unwrap().unwrap();
        assert_eq!(runtime.context(), TenantContext::SignedOut);
        assert_eq!(runtime.connections().state(), ConnectionState::NoConnection);
    }

    #[tokio::test]
    async fn test_build_without_identity_url_fails() {
        let config = LayerConfig::builder().build().unwrap();
        let result = TenantRuntime::builder(config)
            .database(LocalDatabase::in_memory().await.unwrap())
            .build()
            .await;
        assert_matches!(result, Err(RuntimeError::Config(ConfigError::MissingValue("identity_url"))));
    }
}
