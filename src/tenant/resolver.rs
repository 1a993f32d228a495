//! Tenant config resolution
//!
//! Reads a principal's profile record from the control plane and turns it
//! into a [`Resolution`]. A missing record is a normal outcome
//! (`Unprovisioned`), not an error.

use super::descriptor::{ProfileRecord, Resolution, TenantConfig};
use crate::shared::{ChangeKind, Record, ResolveError};
use crate::store::DocumentStore;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Reads profile records from the control plane
#[derive(Debug, Clone)]
pub struct TenantConfigResolver {
    control: Arc<dyn DocumentStore>,
    profile_collection: String,
}

impl TenantConfigResolver {
    pub fn new(control: Arc<dyn DocumentStore>, profile_collection: impl Into<String>) -> Self {
        Self {
            control,
            profile_collection: profile_collection.into(),
        }
    }

    /// Resolve the tenant for `principal_id`
    pub async fn resolve(&self, principal_id: &str) -> Result<Resolution, ResolveError> {
        let record = self.control.get(&self.profile_collection, principal_id).await?;
        let resolution = interpret(record);
        match &resolution {
            Ok(Resolution::Provisioned(config)) => {
                tracing::info!("[Resolver] {} -> tenant {}", principal_id, config.tenant_id());
            }
            Ok(Resolution::Unprovisioned) => {
                tracing::info!("[Resolver] {} is not provisioned", principal_id);
            }
            Err(e) => tracing::warn!("[Resolver] {} misconfigured: {}", principal_id, e),
        }
        resolution
    }

    /// Follow live changes to the principal's profile record.
    ///
    /// Emits a resolution each time the interpreted result changes. A deleted
    /// record resolves to `Unprovisioned`.
    pub async fn watch(&self, principal_id: &str) -> Result<DescriptorWatch, ResolveError> {
        let mut feed = self.control.watch(&self.profile_collection).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let principal = principal_id.to_string();

        let task = tokio::spawn(async move {
            let mut last: Option<Result<Resolution, ResolveError>> = None;
            while let Some(event) = feed.next().await {
                if event.record_id != principal {
                    continue;
                }
                let result = match event.kind {
                    ChangeKind::Deleted => Ok(Resolution::Unprovisioned),
                    ChangeKind::Created | ChangeKind::Updated => interpret(event.record),
                };
                if last.as_ref() == Some(&result) {
                    continue;
                }
                tracing::debug!("[Resolver] profile {} changed", principal);
                last = Some(result.clone());
                if tx.send(result).is_err() {
                    break;
                }
            }
        });

        Ok(DescriptorWatch { rx, task })
    }
}

/// Interpret a (possibly absent) profile record
pub fn interpret(record: Option<Record>) -> Result<Resolution, ResolveError> {
    let Some(record) = record else {
        return Ok(Resolution::Unprovisioned);
    };
    let profile: ProfileRecord =
        serde_json::from_value(record.data).map_err(|e| ResolveError::Malformed {
            message: e.to_string(),
        })?;
    let Some(raw) = profile.tenant_descriptor else {
        return Ok(Resolution::Unprovisioned);
    };
    let descriptor = raw
        .into_descriptor()
        .map_err(|missing| ResolveError::Incomplete { missing })?;
    Ok(Resolution::Provisioned(TenantConfig {
        descriptor,
        asset_store: profile.asset_store_descriptor,
        role: profile.role,
    }))
}

/// Live resolution feed for one principal; dropping it stops the feed
#[derive(Debug)]
pub struct DescriptorWatch {
    rx: mpsc::UnboundedReceiver<Result<Resolution, ResolveError>>,
    task: JoinHandle<()>,
}

impl DescriptorWatch {
    /// Next changed resolution, `None` once the feed has ended
    pub async fn next(&mut self) -> Option<Result<Resolution, ResolveError>> {
        self.rx.recv().await
    }
}

impl Drop for DescriptorWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use crate::tenant::ConnectionDescriptor;
    use serde_json::json;
    use std::time::Duration;

    fn profile(data: serde_json::Value) -> Record {
        Record::new("u1", data)
    }

    #[test]
    fn test_absent_record_is_unprovisioned() {
        assert_eq!(interpret(None).unwrap(), Resolution::Unprovisioned);
    }

    #[test]
    fn test_record_without_descriptor_is_unprovisioned() {
        let record = profile(json!({"principal_id": "u1", "role": "viewer"}));
        assert_eq!(interpret(Some(record)).unwrap(), Resolution::Unprovisioned);
    }

    #[test]
    fn test_incomplete_descriptor_is_an_error() {
        let record = profile(json!({"tenant_descriptor": {"endpoint_id": "ep"}}));
        let err = interpret(Some(record)).unwrap_err();
        assert_eq!(
            err,
            ResolveError::Incomplete {
                missing: vec!["project_id".to_string(), "api_key".to_string()]
            }
        );
    }

    #[test]
    fn test_malformed_record() {
        let record = profile(json!({"tenant_descriptor": "not an object"}));
        assert!(matches!(interpret(Some(record)), Err(ResolveError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_resolve_provisioned() {
        let control = Arc::new(InMemoryDocumentStore::new("control"));
        control
            .insert(
                "profiles",
                profile(json!({
                    "role": "admin",
                    "tenant_descriptor": {"endpoint_id": "ep", "project_id": "acme", "api_key": "k"},
                    "asset_store_descriptor": {"bucket": "acme-assets"}
                })),
            )
            .await;
        let resolver = TenantConfigResolver::new(control, "profiles");

        match resolver.resolve("u1").await.unwrap() {
            Resolution::Provisioned(config) => {
                assert_eq!(config.descriptor, ConnectionDescriptor::new("ep", "acme", "k"));
                assert_eq!(config.role.as_deref(), Some("admin"));
                assert_eq!(config.asset_store.unwrap().bucket, "acme-assets");
            }
            other => panic!("Expected Provisioned, got {:?}", other),
        }
        assert_eq!(resolver.resolve("nobody").await.unwrap(), Resolution::Unprovisioned);
    }

    #[tokio::test]
    async fn test_resolve_surfaces_control_plane_failure() {
        let control = Arc::new(InMemoryDocumentStore::new("control"));
        control.set_unreachable(true);
        let resolver = TenantConfigResolver::new(control, "profiles");
        assert!(matches!(resolver.resolve("u1").await, Err(ResolveError::Store(_))));
    }

    #[tokio::test]
    async fn test_watch_emits_changes_for_principal_only() {
        let control = Arc::new(InMemoryDocumentStore::new("control"));
        let resolver = TenantConfigResolver::new(control.clone(), "profiles");
        let mut watch = resolver.watch("u1").await.unwrap();

        control
            .create("profiles", "someone-else", json!({"tenant_descriptor": {"endpoint_id": "x", "project_id": "y", "api_key": "z"}}))
            .await
            .unwrap();
        control
            .create("profiles", "u1", json!({"tenant_descriptor": {"endpoint_id": "ep", "project_id": "acme", "api_key": "k"}}))
            .await
            .unwrap();
        // Same descriptor, new role: still a different resolution.
        control.update("profiles", "u1", json!({"role": "admin"})).await.unwrap();
        control.delete("profiles", "u1").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert!(matches!(first, Ok(Resolution::Provisioned(ref c)) if c.descriptor.project_id == "acme"));

        let second = tokio::time::timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert!(matches!(second, Ok(Resolution::Provisioned(ref c)) if c.role.as_deref() == Some("admin")));

        let third = tokio::time::timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(third, Ok(Resolution::Unprovisioned));
    }
}
