//! Layer configuration module
//!
//! `LayerConfig` is assembled from defaults, an optional TOML file and
//! `TENANTLINK_*` environment overrides, in that order, and validated once
//! before any component is built from it.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default control-plane collection holding profile records
pub const DEFAULT_PROFILE_COLLECTION: &str = "profiles";

/// Default data-plane base URL template
pub const DEFAULT_DATA_PLANE_URL_TEMPLATE: &str = "https://{endpoint}";

/// Default retry ceiling before a write is dead-lettered
pub const DEFAULT_RETRY_CEILING: u32 = 5;

/// Configuration for the tenant routing and offline layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    /// Base URL of the control-plane identity provider
    pub identity_url: Option<String>,
    /// Base URL of the control-plane document store
    pub control_plane_url: Option<String>,
    /// Project id of the control-plane document store
    pub control_plane_project: String,
    /// Control-plane collection holding profile records
    pub profile_collection: String,
    /// Data-plane base URL; `{endpoint}` and `{region}` come from the
    /// tenant descriptor
    pub data_plane_url_template: String,
    /// Local SQLite database file
    pub local_db_path: PathBuf,
    /// Collections whose writes always go through the local buffer
    pub replicated_collections: Vec<String>,
    /// Upper bound for a data-plane handshake
    pub handshake_timeout: Duration,
    /// Upper bound for draining in-flight requests on close
    pub drain_timeout: Duration,
    /// Per-request timeout for HTTP clients
    pub request_timeout: Duration,
    /// Connectivity debounce window
    pub connectivity_hysteresis: Duration,
    /// Failed attempts allowed before a write is dead-lettered
    pub retry_ceiling: u32,
    /// First retry delay after a transient sync failure
    pub retry_base_delay: Duration,
    /// Cap on the retry delay
    pub retry_max_delay: Duration,
    /// URL probed to detect connectivity (disabled when unset)
    pub probe_url: Option<String>,
    /// Interval between connectivity probes
    pub probe_interval: Duration,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            identity_url: None,
            control_plane_url: None,
            control_plane_project: "control".to_string(),
            profile_collection: DEFAULT_PROFILE_COLLECTION.to_string(),
            data_plane_url_template: DEFAULT_DATA_PLANE_URL_TEMPLATE.to_string(),
            local_db_path: default_db_path(),
            replicated_collections: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(15),
            connectivity_hysteresis: Duration::from_millis(500),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            probe_url: None,
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Platform data directory location of the local database
fn default_db_path() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push("tenantlink");
    path.push("local.db");
    path
}

/// On-disk TOML shape; every field optional, durations in milliseconds
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    identity_url: Option<String>,
    control_plane_url: Option<String>,
    control_plane_project: Option<String>,
    profile_collection: Option<String>,
    data_plane_url_template: Option<String>,
    local_db_path: Option<PathBuf>,
    replicated_collections: Option<Vec<String>>,
    handshake_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    connectivity_hysteresis_ms: Option<u64>,
    retry_ceiling: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    probe_url: Option<String>,
    probe_interval_ms: Option<u64>,
}

impl LayerConfig {
    /// Create a new LayerConfigBuilder
    pub fn builder() -> LayerConfigBuilder {
        LayerConfigBuilder::default()
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(source)?;
        let mut config = Self::default();
        config.merge_file(file);
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Load defaults, an optional file, then process environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TENANTLINK_*` overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TENANTLINK_IDENTITY_URL") {
            self.identity_url = Some(url);
        }
        if let Some(url) = lookup("TENANTLINK_CONTROL_PLANE_URL") {
            self.control_plane_url = Some(url);
        }
        if let Some(template) = lookup("TENANTLINK_DATA_PLANE_URL_TEMPLATE") {
            self.data_plane_url_template = template;
        }
        if let Some(path) = lookup("TENANTLINK_LOCAL_DB") {
            self.local_db_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("TENANTLINK_PROBE_URL") {
            self.probe_url = Some(url);
        }
        if let Some(list) = lookup("TENANTLINK_REPLICATED_COLLECTIONS") {
            self.replicated_collections = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("TENANTLINK_RETRY_CEILING") {
            self.retry_ceiling = raw.parse().map_err(|_| ConfigError::InvalidValue {
                field: "retry_ceiling",
                message: format!("not a number: {}", raw),
            })?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for url in [&self.identity_url, &self.control_plane_url, &self.probe_url]
            .into_iter()
            .flatten()
        {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidUrl(url.clone()));
            }
        }
        if !self.data_plane_url_template.contains("{endpoint}") {
            return Err(ConfigError::InvalidValue {
                field: "data_plane_url_template",
                message: "must contain {endpoint}".to_string(),
            });
        }
        if self.profile_collection.is_empty() {
            return Err(ConfigError::MissingValue("profile_collection"));
        }
        if self.control_plane_project.is_empty() {
            return Err(ConfigError::MissingValue("control_plane_project"));
        }
        if self.retry_ceiling == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry_ceiling",
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::InvalidValue {
                field: "retry_base_delay",
                message: "exceeds retry_max_delay".to_string(),
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "handshake_timeout",
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Whether writes to `collection` always go through the buffer
    pub fn is_replicated(&self, collection: &str) -> bool {
        self.replicated_collections.iter().any(|c| c == collection)
    }

    fn merge_file(&mut self, file: FileConfig) {
        let ms = Duration::from_millis;
        if file.identity_url.is_some() {
            self.identity_url = file.identity_url;
        }
        if file.control_plane_url.is_some() {
            self.control_plane_url = file.control_plane_url;
        }
        if let Some(project) = file.control_plane_project {
            self.control_plane_project = project;
        }
        if let Some(collection) = file.profile_collection {
            self.profile_collection = collection;
        }
        if let Some(template) = file.data_plane_url_template {
            self.data_plane_url_template = template;
        }
        if let Some(path) = file.local_db_path {
            self.local_db_path = path;
        }
        if let Some(collections) = file.replicated_collections {
            self.replicated_collections = collections;
        }
        if let Some(v) = file.handshake_timeout_ms {
            self.handshake_timeout = ms(v);
        }
        if let Some(v) = file.drain_timeout_ms {
            self.drain_timeout = ms(v);
        }
        if let Some(v) = file.request_timeout_ms {
            self.request_timeout = ms(v);
        }
        if let Some(v) = file.connectivity_hysteresis_ms {
            self.connectivity_hysteresis = ms(v);
        }
        if let Some(v) = file.retry_ceiling {
            self.retry_ceiling = v;
        }
        if let Some(v) = file.retry_base_delay_ms {
            self.retry_base_delay = ms(v);
        }
        if let Some(v) = file.retry_max_delay_ms {
            self.retry_max_delay = ms(v);
        }
        if file.probe_url.is_some() {
            self.probe_url = file.probe_url;
        }
        if let Some(v) = file.probe_interval_ms {
            self.probe_interval = ms(v);
        }
    }
}

/// Builder for LayerConfig
#[derive(Debug, Default)]
pub struct LayerConfigBuilder {
    config: Option<LayerConfig>,
}

impl LayerConfigBuilder {
    fn config(&mut self) -> &mut LayerConfig {
        self.config.get_or_insert_with(LayerConfig::default)
    }

    /// Set the identity provider URL
    pub fn identity_url(mut self, url: impl Into<String>) -> Self {
        self.config().identity_url = Some(url.into());
        self
    }

    /// Set the control-plane store URL
    pub fn control_plane_url(mut self, url: impl Into<String>) -> Self {
        self.config().control_plane_url = Some(url.into());
        self
    }

    pub fn profile_collection(mut self, collection: impl Into<String>) -> Self {
        self.config().profile_collection = collection.into();
        self
    }

    pub fn data_plane_url_template(mut self, template: impl Into<String>) -> Self {
        self.config().data_plane_url_template = template.into();
        self
    }

    pub fn local_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config().local_db_path = path.into();
        self
    }

    /// Mark a collection as replicated
    pub fn replicate(mut self, collection: impl Into<String>) -> Self {
        self.config().replicated_collections.push(collection.into());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config().handshake_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config().drain_timeout = timeout;
        self
    }

    pub fn connectivity_hysteresis(mut self, window: Duration) -> Self {
        self.config().connectivity_hysteresis = window;
        self
    }

    pub fn retry_ceiling(mut self, ceiling: u32) -> Self {
        self.config().retry_ceiling = ceiling;
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        let config = self.config();
        config.retry_base_delay = base;
        config.retry_max_delay = max;
        self
    }

    pub fn probe(mut self, url: impl Into<String>, interval: Duration) -> Self {
        let config = self.config();
        config.probe_url = Some(url.into());
        config.probe_interval = interval;
        self
    }

    /// Build the configuration
    pub fn build(mut self) -> Result<LayerConfig, ConfigError> {
        let config = self.config().clone();
        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = LayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_ceiling, 5);
        assert_eq!(config.profile_collection, "profiles");
        assert!(config.local_db_path.ends_with("tenantlink/local.db"));
    }

    #[test]
    fn test_builder() {
        let config = LayerConfig::builder()
            .identity_url("https://id.example.com")
            .replicate("orders")
            .replicate("customers")
            .retry_ceiling(3)
            .build()
            .unwrap();
        assert_eq!(config.identity_url.as_deref(), Some("https://id.example.com"));
        assert!(config.is_replicated("orders"));
        assert!(!config.is_replicated("employees"));
        assert_eq!(config.retry_ceiling, 3);
    }

    #[test]
    fn test_builder_rejects_bad_url() {
        let result = LayerConfig::builder().control_plane_url("ftp://nope").build();
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_builder_rejects_template_without_endpoint() {
        let result = LayerConfig::builder()
            .data_plane_url_template("https://data.example.com")
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "data_plane_url_template", .. })
        ));
    }

    #[test]
    fn test_builder_rejects_zero_ceiling() {
        let result = LayerConfig::builder().retry_ceiling(0).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "retry_ceiling", .. })
        ));
    }

    #[test]
    fn test_from_toml() {
        let config = LayerConfig::from_toml_str(
            r#"
            control_plane_url = "https://control.example.com"
            replicated_collections = ["orders"]
            handshake_timeout_ms = 2500
            retry_ceiling = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.control_plane_url.as_deref(), Some("https://control.example.com"));
        assert_eq!(config.replicated_collections, vec!["orders".to_string()]);
        assert_eq!(config.handshake_timeout, Duration::from_millis(2500));
        assert_eq!(config.retry_ceiling, 7);
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        let result = LayerConfig::from_toml_str("retry_cieling = 3");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TENANTLINK_CONTROL_PLANE_URL", "http://localhost:8080"),
            ("TENANTLINK_REPLICATED_COLLECTIONS", "orders, customers,"),
            ("TENANTLINK_RETRY_CEILING", "2"),
        ]
        .into_iter()
        .collect();

        let mut config = LayerConfig::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.control_plane_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.replicated_collections, vec!["orders", "customers"]);
        assert_eq!(config.retry_ceiling, 2);
    }

    #[test]
    fn test_env_override_bad_number() {
        let mut config = LayerConfig::default();
        let result = config.apply_env_from(|key| {
            (key == "TENANTLINK_RETRY_CEILING").then(|| "five".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
