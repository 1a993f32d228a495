//! Tenant descriptors and profile records
//!
//! A profile record lives in the control plane, keyed by principal id. It
//! may carry a raw tenant descriptor, which is validated into a
//! [`ConnectionDescriptor`] before the connection manager ever sees it.

use crate::shared::ConnectError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a tenant backend: `"{endpoint_id}/{project_id}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Validated connection parameters for one tenant backend.
///
/// Equality is field-wise: two descriptors name the same connection only if
/// every field matches.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub endpoint_id: String,
    pub project_id: String,
    pub region: Option<String>,
    pub api_key: String,
    /// Provider-specific extra fields
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

impl ConnectionDescriptor {
    pub fn new(
        endpoint_id: impl Into<String>,
        project_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            project_id: project_id.into(),
            region: None,
            api_key: api_key.into(),
            credentials: BTreeMap::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    pub fn tenant_id(&self) -> TenantId {
        TenantId(format!("{}/{}", self.endpoint_id, self.project_id))
    }

    /// Reject descriptors that cannot possibly connect
    pub fn validate(&self) -> Result<(), ConnectError> {
        let blank = [
            ("endpoint_id", &self.endpoint_id),
            ("project_id", &self.project_id),
            ("api_key", &self.api_key),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        if let Some((field, _)) = blank {
            return Err(ConnectError::DescriptorInvalid {
                message: format!("{} is empty", field),
            });
        }
        if self.project_id.contains('/') {
            return Err(ConnectError::DescriptorInvalid {
                message: "project_id must not contain '/'".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("endpoint_id", &self.endpoint_id)
            .field("project_id", &self.project_id)
            .field("region", &self.region)
            .field("api_key", &"<redacted>")
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Descriptor as stored in a profile record; every field optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDescriptor {
    #[serde(default)]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Anything else is an extra credential field
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RawDescriptor {
    /// Validate mandatory fields, returning the names of those missing.
    ///
    /// Empty strings count as missing.
    pub fn into_descriptor(self) -> Result<ConnectionDescriptor, Vec<String>> {
        fn present(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }

        let endpoint_id = present(self.endpoint_id);
        let project_id = present(self.project_id);
        let api_key = present(self.api_key);

        let missing: Vec<String> = [
            ("endpoint_id", endpoint_id.is_none()),
            ("project_id", project_id.is_none()),
            ("api_key", api_key.is_none()),
        ]
        .into_iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| name.to_string())
        .collect();

        match (endpoint_id, project_id, api_key) {
            (Some(endpoint_id), Some(project_id), Some(api_key)) => Ok(ConnectionDescriptor {
                endpoint_id,
                project_id,
                region: present(self.region),
                api_key,
                credentials: self
                    .extra
                    .into_iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(key, value)| match value {
                        Value::String(s) => (key, s),
                        other => (key, other.to_string()),
                    })
                    .collect(),
            }),
            _ => Err(missing),
        }
    }
}

/// Auxiliary object-storage settings for the tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetStoreDescriptor {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// Control-plane profile record body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub tenant_descriptor: Option<RawDescriptor>,
    #[serde(default)]
    pub asset_store_descriptor: Option<AssetStoreDescriptor>,
}

/// Everything a provisioned principal needs to reach its tenant
#[derive(Debug, Clone, PartialEq)]
pub struct TenantConfig {
    pub descriptor: ConnectionDescriptor,
    pub asset_store: Option<AssetStoreDescriptor>,
    pub role: Option<String>,
}

impl TenantConfig {
    pub fn tenant_id(&self) -> TenantId {
        self.descriptor.tenant_id()
    }
}

/// Outcome of resolving a principal's tenant
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Provisioned(TenantConfig),
    /// No profile record, or a record without a descriptor
    Unprovisioned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tenant_id_format() {
        let descriptor = ConnectionDescriptor::new("ep-1", "acme", "secret");
        assert_eq!(descriptor.tenant_id().as_str(), "ep-1/acme");
        assert_eq!(descriptor.tenant_id().to_string(), "ep-1/acme");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let descriptor = ConnectionDescriptor::new("ep-1", "acme", "super-secret")
            .with_credential("service_token", "also-secret");
        let debug = format!("{:?}", descriptor);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("also-secret"));
        assert!(debug.contains("service_token"));
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionDescriptor::new("ep", "acme", "key").validate().is_ok());
        assert!(matches!(
            ConnectionDescriptor::new("ep", "", "key").validate(),
            Err(ConnectError::DescriptorInvalid { .. })
        ));
        assert!(ConnectionDescriptor::new("ep", "a/b", "key").validate().is_err());
    }

    #[test]
    fn test_raw_descriptor_reports_missing_fields() {
        let raw: RawDescriptor = serde_json::from_value(json!({
            "endpoint_id": "ep",
            "project_id": "",
        }))
        .unwrap();
        assert_eq!(
            raw.into_descriptor().unwrap_err(),
            vec!["project_id".to_string(), "api_key".to_string()]
        );
    }

    #[test]
    fn test_raw_descriptor_keeps_extra_credentials() {
        let raw: RawDescriptor = serde_json::from_value(json!({
            "endpoint_id": "ep",
            "project_id": "acme",
            "api_key": "k",
            "region": "eu-west",
            "service_token": "t",
            "shard": 3,
        }))
        .unwrap();
        let descriptor = raw.into_descriptor().unwrap();
        assert_eq!(descriptor.region.as_deref(), Some("eu-west"));
        assert_eq!(descriptor.credentials.get("service_token").map(String::as_str), Some("t"));
        assert_eq!(descriptor.credentials.get("shard").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_profile_record_without_descriptor() {
        let profile: ProfileRecord =
            serde_json::from_value(json!({"principal_id": "u1", "role": "admin"})).unwrap();
        assert!(profile.tenant_descriptor.is_none());
        assert_eq!(profile.role.as_deref(), Some("admin"));
    }
}
