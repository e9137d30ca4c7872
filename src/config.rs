//! Clustering configuration
//!
//! Loaded from TOML; every field has a default, so an empty file is valid:
//!
//! ```toml
//! [cluster]
//! cluster_id = "prod-eu"
//!
//! [gateway]
//! gateway_list_refresh_period_ms = 30000
//!
//! [store]
//! directory_name = "ream-clustering"
//! # 0 disables the per-operation deadline
//! operation_timeout_ms = 5000
//!
//! [store.retry]
//! max_attempts = 10
//! initial_backoff_ms = 10
//! max_backoff_ms = 1000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusteringError, ClusteringResult};
use crate::store::RetryPolicy;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub cluster: ClusterOptions,
    pub gateway: GatewayOptions,
    pub store: StoreOptions,
}

impl ClusteringConfig {
    pub fn from_toml_str(content: &str) -> ClusteringResult<Self> {
        let config: ClusteringConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClusteringResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ClusteringError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> ClusteringResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ClusteringError::Configuration(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> ClusteringResult<()> {
        if self.cluster.cluster_id.trim().is_empty() {
            return Err(ClusteringError::Configuration("cluster_id must not be empty".into()));
        }
        if self.store.directory_name.is_empty() {
            return Err(ClusteringError::Configuration(
                "directory_name must not be empty".into(),
            ));
        }
        if self.store.retry.max_attempts == 0 {
            return Err(ClusteringError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.store.retry.initial_backoff > self.store.retry.max_backoff {
            return Err(ClusteringError::Configuration(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        if self.store.operation_timeout == Some(Duration::ZERO) {
            return Err(ClusteringError::Configuration(
                "operation_timeout must be None rather than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Identity of the cluster this process belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    pub cluster_id: String,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
        }
    }
}

/// Gateway list settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayOptions {
    /// How long a client may use a gateway list before refreshing it
    #[serde(with = "duration_ms", rename = "gateway_list_refresh_period_ms")]
    pub gateway_list_refresh_period: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            gateway_list_refresh_period: Duration::from_secs(60),
        }
    }
}

/// Where and how the membership table is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Directory holding every cluster's membership keys
    pub directory_name: String,
    /// Raw prefix (UTF-8) the directory lives under
    pub root_prefix: String,
    /// Deadline for each membership operation, retries included
    #[serde(with = "duration_ms_opt", rename = "operation_timeout_ms")]
    pub operation_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            directory_name: "ream-clustering".to_string(),
            root_prefix: String::new(),
            operation_timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
        }
    }
}

/// `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as whole milliseconds, `0` standing for `None`
pub mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.map_or(0, |d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        u64::deserialize(deserializer).map(|ms| (ms > 0).then(|| Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ClusteringConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClusteringConfig::default());
        assert_eq!(config.store.directory_name, "ream-clustering");
        assert_eq!(config.gateway.gateway_list_refresh_period, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_full_config() {
        let config = ClusteringConfig::from_toml_str(
            r#"
            [cluster]
            cluster_id = "prod-eu"

            [gateway]
            gateway_list_refresh_period_ms = 30000

            [store]
            directory_name = "membership"
            operation_timeout_ms = 5000

            [store.retry]
            max_attempts = 3
            initial_backoff_ms = 5
            max_backoff_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.cluster_id, "prod-eu");
        assert_eq!(config.gateway.gateway_list_refresh_period, Duration::from_secs(30));
        assert_eq!(config.store.directory_name, "membership");
        assert_eq!(config.store.operation_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.store.retry.max_attempts, 3);
        assert_eq!(config.store.retry.max_backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ClusteringConfig::from_toml_str("[cluster]\ncluster_id = \"  \""),
            Err(ClusteringError::Configuration(_))
        ));
        assert!(matches!(
            ClusteringConfig::from_toml_str("[store.retry]\nmax_attempts = 0"),
            Err(ClusteringError::Configuration(_))
        ));
        let mut zero = ClusteringConfig::default();
        zero.store.operation_timeout = Some(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(ClusteringError::Configuration(_))));
        assert!(matches!(
            ClusteringConfig::from_toml_str("[cluster]\ncluster_id = 7"),
            Err(ClusteringError::Configuration(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let mut config = ClusteringConfig::default();
        config.cluster.cluster_id = "from-file".into();
        config.store.operation_timeout = Some(Duration::from_millis(1500));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes()).unwrap();

        let loaded = ClusteringConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(ClusteringConfig::from_file("/nonexistent/clustering.toml").is_err());
    }

    #[test]
    fn test_disabled_timeout_survives_round_trip() {
        let mut config = ClusteringConfig::default();
        config.store.operation_timeout = None;

        let text = config.to_toml_string().unwrap();
        assert!(text.contains("operation_timeout_ms = 0"));
        let loaded = ClusteringConfig::from_toml_str(&text).unwrap();
        assert_eq!(loaded.store.operation_timeout, None);
        assert_eq!(loaded, config);

        let loaded = ClusteringConfig::from_toml_str("[store]\noperation_timeout_ms = 0").unwrap();
        assert_eq!(loaded.store.operation_timeout, None);
    }

    #[test]
    fn test_cluster_section_carries_only_cluster_id() {
        let text = ClusteringConfig::default().to_toml_string().unwrap();
        assert!(!text.contains("service_id"));

        // Files written for older layouts still load
        let config = ClusteringConfig::from_toml_str("[cluster]\ncluster_id = \"prod\"\nservice_id = \"orders\"").unwrap();
        assert_eq!(config.cluster.cluster_id, "prod");
    }
}
