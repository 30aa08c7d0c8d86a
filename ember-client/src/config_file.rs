//! Declarative configuration loading from YAML, TOML, and environment variables.
//!
//! The structs here mirror [`ClientConfig`](crate::config::ClientConfig) with
//! serde-friendly field types and are converted through the builder API, so
//! file-based configuration is validated exactly like programmatic configuration.
//!
//! # Supported Formats
//!
//! - **YAML** (requires `config-file` feature): `ClientConfig::from_yaml("ember.yaml")`
//! - **TOML** (requires `config-file` feature): `ClientConfig::from_toml("ember.toml")`
//! - **Environment Variables** (always available): `ClientConfig::from_env()`
//!
//! # Example YAML
//!
//! ```yaml
//! bucket: travel
//! network:
//!   addresses:
//!     - "10.0.0.1:11210"
//!     - "10.0.0.2"
//!   connections-per-node: 2
//!   heartbeat-interval-ms: 5000
//! retry:
//!   initial-backoff-ms: 1
//!   max-backoff-ms: 500
//!   jitter: 0.25
//!   max-attempts: 10
//! timeouts:
//!   kv-timeout-ms: 2500
//! security:
//!   username: app
//!   password: secret
//! transactions:
//!   expiration-ms: 15000
//!   durability: majority
//!   metadata-collection: txn.meta
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ember_core::{CollectionName, DurabilityLevel};

use crate::config::{ClientConfig, ClientConfigBuilder, ConfigError};
use crate::connection::DEFAULT_KV_PORT;

/// Top-level file-based configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    /// Bucket to open.
    pub bucket: Option<String>,
    /// Agent name sent during the handshake.
    pub user_agent: Option<String>,
    /// Network configuration.
    pub network: Option<FileNetworkConfig>,
    /// Retry configuration.
    pub retry: Option<FileRetryConfig>,
    /// Timeout configuration.
    pub timeouts: Option<FileTimeoutConfig>,
    /// Credentials.
    pub security: Option<FileSecurityConfig>,
    /// Transaction defaults.
    pub transactions: Option<FileTransactionsConfig>,
    /// Diagnostics configuration.
    pub diagnostics: Option<FileDiagnosticsConfig>,
}

/// File-based network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileNetworkConfig {
    /// Bootstrap addresses; the default port is appended when missing.
    pub addresses: Option<Vec<String>>,
    /// Connection timeout in milliseconds.
    pub connection_timeout_ms: Option<u64>,
    /// Connections kept to each node.
    pub connections_per_node: Option<usize>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: Option<u64>,
    /// Idle timeout in milliseconds.
    pub idle_timeout_ms: Option<u64>,
    /// Configuration poll interval in milliseconds.
    pub config_poll_interval_ms: Option<u64>,
    /// Maximum frame body size in bytes.
    pub max_frame_size: Option<usize>,
    /// Reconnect attempts before a node is marked unreachable.
    pub reconnect_attempts: Option<u32>,
    /// Reachability check interval for unreachable nodes in milliseconds.
    pub recheck_interval_ms: Option<u64>,
    /// Outbound queue capacity per connection.
    pub queue_capacity: Option<usize>,
}

/// File-based retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileRetryConfig {
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: Option<u64>,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: Option<u64>,
    /// Backoff multiplier.
    pub multiplier: Option<f64>,
    /// Jitter factor (0.0 to 1.0).
    pub jitter: Option<f64>,
    /// Maximum attempts per operation.
    pub max_attempts: Option<u32>,
}

/// File-based timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileTimeoutConfig {
    /// KV timeout in milliseconds.
    pub kv_timeout_ms: Option<u64>,
    /// Durable KV timeout in milliseconds.
    pub kv_durable_timeout_ms: Option<u64>,
    /// Bootstrap timeout in milliseconds.
    pub bootstrap_timeout_ms: Option<u64>,
}

/// File-based credentials.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileSecurityConfig {
    /// Username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
}

/// File-based transaction defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileTransactionsConfig {
    /// Expiration in milliseconds.
    pub expiration_ms: Option<u64>,
    /// Per-operation KV timeout in milliseconds.
    pub kv_timeout_ms: Option<u64>,
    /// Durability level name, e.g. `majority`.
    pub durability: Option<String>,
    /// Cleanup scan interval in milliseconds.
    pub cleanup_window_ms: Option<u64>,
    /// Whether to resolve other clients' expired attempts.
    pub cleanup_lost_attempts: Option<bool>,
    /// Whether to finish this client's incomplete attempts.
    pub cleanup_client_attempts: Option<bool>,
    /// Metadata collection as `scope.collection`.
    pub metadata_collection: Option<String>,
    /// Number of attempt record slots.
    pub atr_slots: Option<u16>,
}

/// File-based diagnostics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileDiagnosticsConfig {
    /// Slow operation threshold in milliseconds.
    pub slow_operation_threshold_ms: Option<u64>,
    /// Whether to log slow operations.
    pub slow_operation_logging: Option<bool>,
}

fn parse_address(raw: &str) -> Result<SocketAddr, ConfigError> {
    let raw = raw.trim();
    raw.parse::<SocketAddr>()
        .or_else(|_| format!("{raw}:{DEFAULT_KV_PORT}").parse::<SocketAddr>())
        .map_err(|_| ConfigError::new(format!("invalid address '{raw}'")))
}

impl TryFrom<FileConfig> for ClientConfig {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        let mut builder = ClientConfigBuilder::new();

        if let Some(bucket) = file.bucket {
            builder = builder.bucket(bucket);
        }

        if let Some(agent) = file.user_agent {
            builder = builder.user_agent(agent);
        }

        if let Some(net) = file.network {
            let addresses = net
                .addresses
                .unwrap_or_default()
                .iter()
                .map(|raw| parse_address(raw))
                .collect::<Result<Vec<_>, _>>()?;

            builder = builder.network(|mut n| {
                if !addresses.is_empty() {
                    n = n.addresses(addresses);
                }
                if let Some(ms) = net.connection_timeout_ms {
                    n = n.connection_timeout(Duration::from_millis(ms));
                }
                if let Some(count) = net.connections_per_node {
                    n = n.connections_per_node(count);
                }
                if let Some(ms) = net.heartbeat_interval_ms {
                    n = n.heartbeat_interval(Duration::from_millis(ms));
                }
                if let Some(ms) = net.idle_timeout_ms {
                    n = n.idle_timeout(Duration::from_millis(ms));
                }
                if let Some(ms) = net.config_poll_interval_ms {
                    n = n.config_poll_interval(Duration::from_millis(ms));
                }
                if let Some(size) = net.max_frame_size {
                    n = n.max_frame_size(size);
                }
                if let Some(attempts) = net.reconnect_attempts {
                    n = n.reconnect_attempts(attempts);
                }
                if let Some(ms) = net.recheck_interval_ms {
                    n = n.recheck_interval(Duration::from_millis(ms));
                }
                if let Some(capacity) = net.queue_capacity {
                    n = n.queue_capacity(capacity);
                }
                n
            });
        }

        if let Some(retry) = file.retry {
            builder = builder.retry(|mut r| {
                if let Some(ms) = retry.initial_backoff_ms {
                    r = r.initial_backoff(Duration::from_millis(ms));
                }
                if let Some(ms) = retry.max_backoff_ms {
                    r = r.max_backoff(Duration::from_millis(ms));
                }
                if let Some(m) = retry.multiplier {
                    r = r.multiplier(m);
                }
                if let Some(j) = retry.jitter {
                    r = r.jitter(j);
                }
                if let Some(n) = retry.max_attempts {
                    r = r.max_attempts(n);
                }
                r
            });
        }

        if let Some(timeouts) = file.timeouts {
            builder = builder.timeouts(|mut t| {
                if let Some(ms) = timeouts.kv_timeout_ms {
                    t = t.kv_timeout(Duration::from_millis(ms));
                }
                if let Some(ms) = timeouts.kv_durable_timeout_ms {
                    t = t.kv_durable_timeout(Duration::from_millis(ms));
                }
                if let Some(ms) = timeouts.bootstrap_timeout_ms {
                    t = t.bootstrap_timeout(Duration::from_millis(ms));
                }
                t
            });
        }

        if let Some(security) = file.security {
            builder = builder.security(|mut s| {
                if let Some(user) = security.username {
                    s = s.username(user);
                }
                if let Some(password) = security.password {
                    s = s.password(password);
                }
                s
            });
        }

        if let Some(txn) = file.transactions {
            let durability = txn
                .durability
                .as_deref()
                .map(str::parse::<DurabilityLevel>)
                .transpose()
                .map_err(|e| ConfigError::new(e.to_string()))?;
            let metadata = txn
                .metadata_collection
                .as_deref()
                .map(str::parse::<CollectionName>)
                .transpose()
                .map_err(|e| ConfigError::new(e.to_string()))?;

            builder = builder.transactions(|mut t| {
                if let Some(ms) = txn.expiration_ms {
                    t = t.expiration(Duration::from_millis(ms));
                }
                if let Some(ms) = txn.kv_timeout_ms {
                    t = t.kv_timeout(Duration::from_millis(ms));
                }
                if let Some(level) = durability {
                    t = t.durability(level);
                }
                if let Some(ms) = txn.cleanup_window_ms {
                    t = t.cleanup_window(Duration::from_millis(ms));
                }
                if let Some(enabled) = txn.cleanup_lost_attempts {
                    t = t.cleanup_lost_attempts(enabled);
                }
                if let Some(enabled) = txn.cleanup_client_attempts {
                    t = t.cleanup_client_attempts(enabled);
                }
                if let Some(collection) = metadata {
                    t = t.metadata_collection(collection);
                }
                if let Some(slots) = txn.atr_slots {
                    t = t.atr_slots(slots);
                }
                t
            });
        }

        if let Some(diag) = file.diagnostics {
            builder = builder.diagnostics(|mut d| {
                if let Some(ms) = diag.slow_operation_threshold_ms {
                    d = d.slow_operation_threshold(Duration::from_millis(ms));
                }
                if let Some(enabled) = diag.slow_operation_logging {
                    d = d.slow_operation_logging(enabled);
                }
                d
            });
        }

        builder.build()
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::new(format!("{name} must be an integer, got '{val}'"))),
        Err(_) => Ok(None),
    }
}

impl ClientConfig {
    /// Loads configuration from a YAML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_yaml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read YAML config file: {e}")))?;
        Self::from_yaml_str(&content)
    }

    /// Parses configuration from a YAML string.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file_config: FileConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::new(format!("failed to parse YAML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from a TOML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read TOML config file: {e}")))?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file_config: FileConfig = toml_crate::from_str(content)
            .map_err(|e| ConfigError::new(format!("failed to parse TOML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from environment variables.
    ///
    /// This method is always available (no feature flag required).
    ///
    /// # Supported Environment Variables
    ///
    /// | Variable | Maps to |
    /// |----------|---------|
    /// | `EMBER_BUCKET` | `bucket` |
    /// | `EMBER_ADDRESSES` | Comma-separated bootstrap addresses |
    /// | `EMBER_USERNAME` / `EMBER_PASSWORD` | Credentials |
    /// | `EMBER_CONNECTIONS_PER_NODE` | Connections per node |
    /// | `EMBER_KV_TIMEOUT_MS` | KV timeout in milliseconds |
    /// | `EMBER_MAX_ATTEMPTS` | Maximum attempts per operation |
    /// | `EMBER_TXN_EXPIRATION_MS` | Transaction expiration in milliseconds |
    /// | `EMBER_TXN_DURABILITY` | Transaction durability level |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut file_config = FileConfig::default();

        if let Ok(val) = std::env::var("EMBER_BUCKET") {
            file_config.bucket = Some(val);
        }

        if let Ok(val) = std::env::var("EMBER_ADDRESSES") {
            file_config.network.get_or_insert_with(Default::default).addresses = Some(
                val.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }

        if let Ok(val) = std::env::var("EMBER_USERNAME") {
            file_config.security.get_or_insert_with(Default::default).username = Some(val);
        }

        if let Ok(val) = std::env::var("EMBER_PASSWORD") {
            file_config.security.get_or_insert_with(Default::default).password = Some(val);
        }

        if let Some(count) = env_u64("EMBER_CONNECTIONS_PER_NODE")? {
            file_config
                .network
                .get_or_insert_with(Default::default)
                .connections_per_node = Some(count as usize);
        }

        if let Some(ms) = env_u64("EMBER_KV_TIMEOUT_MS")? {
            file_config.timeouts.get_or_insert_with(Default::default).kv_timeout_ms = Some(ms);
        }

        if let Some(n) = env_u64("EMBER_MAX_ATTEMPTS")? {
            let n = u32::try_from(n)
                .map_err(|_| ConfigError::new("EMBER_MAX_ATTEMPTS is out of range"))?;
            file_config.retry.get_or_insert_with(Default::default).max_attempts = Some(n);
        }

        if let Some(ms) = env_u64("EMBER_TXN_EXPIRATION_MS")? {
            file_config
                .transactions
                .get_or_insert_with(Default::default)
                .expiration_ms = Some(ms);
        }

        if let Ok(val) = std::env::var("EMBER_TXN_DURABILITY") {
            file_config
                .transactions
                .get_or_insert_with(Default::default)
                .durability = Some(val);
        }

        file_config.try_into()
    }
}

/// Convenience function to load a configuration file, auto-detecting format by extension.
///
/// Supports `.yaml`, `.yml`, and `.toml` extensions.
/// Requires the `config-file` feature.
#[cfg(feature = "config-file")]
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => ClientConfig::from_yaml(path),
        Some("toml") => ClientConfig::from_toml(path),
        Some(ext) => Err(ConfigError::new(format!(
            "unsupported config file extension: .{ext} (expected .yaml, .yml, or .toml)"
        ))),
        None => Err(ConfigError::new(
            "config file has no extension; expected .yaml, .yml, or .toml",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults_produce_valid_client_config() {
        let config: ClientConfig = FileConfig::default().try_into().unwrap();
        assert_eq!(config.bucket(), "default");
    }

    #[test]
    fn test_file_config_with_network() {
        let file_config = FileConfig {
            network: Some(FileNetworkConfig {
                addresses: Some(vec!["127.0.0.1:12000".to_string(), "10.1.1.1".to_string()]),
                connection_timeout_ms: Some(10_000),
                connections_per_node: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config: ClientConfig = file_config.try_into().unwrap();
        assert_eq!(config.network().addresses().len(), 2);
        assert_eq!(config.network().addresses()[1].port(), 11210);
        assert_eq!(config.network().connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.network().connections_per_node(), 3);
    }

    #[test]
    fn test_file_config_invalid_address() {
        let file_config = FileConfig {
            network: Some(FileNetworkConfig {
                addresses: Some(vec!["not an address".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = ClientConfig::try_from(file_config).unwrap_err();
        assert!(err.to_string().contains("invalid address"));
    }

    #[test]
    fn test_file_config_with_retry() {
        let file_config = FileConfig {
            retry: Some(FileRetryConfig {
                initial_backoff_ms: Some(5),
                max_backoff_ms: Some(1_000),
                multiplier: Some(3.0),
                jitter: Some(0.1),
                max_attempts: Some(4),
            }),
            ..Default::default()
        };
        let config: ClientConfig = file_config.try_into().unwrap();
        assert_eq!(config.retry().initial_backoff(), Duration::from_millis(5));
        assert_eq!(config.retry().max_backoff(), Duration::from_secs(1));
        assert_eq!(config.retry().multiplier(), 3.0);
        assert_eq!(config.retry().jitter(), 0.1);
        assert_eq!(config.retry().max_attempts(), 4);
    }

    #[test]
    fn test_file_config_validation_still_applies() {
        let file_config = FileConfig {
            retry: Some(FileRetryConfig {
                jitter: Some(2.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ClientConfig::try_from(file_config).is_err());
    }

    #[test]
    fn test_file_config_with_transactions() {
        let file_config = FileConfig {
            transactions: Some(FileTransactionsConfig {
                expiration_ms: Some(3_000),
                durability: Some("none".to_string()),
                metadata_collection: Some("txn.meta".to_string()),
                atr_slots: Some(16),
                cleanup_lost_attempts: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config: ClientConfig = file_config.try_into().unwrap();
        let txn = config.transactions();
        assert_eq!(txn.expiration(), Duration::from_secs(3));
        assert_eq!(txn.durability(), DurabilityLevel::None);
        assert_eq!(txn.metadata_collection().unwrap().to_string(), "txn.meta");
        assert_eq!(txn.atr_slots(), 16);
        assert!(!txn.cleanup_lost_attempts());
    }

    #[test]
    fn test_file_config_bad_durability() {
        let file_config = FileConfig {
            transactions: Some(FileTransactionsConfig {
                durability: Some("eventually".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ClientConfig::try_from(file_config).is_err());
    }

    #[test]
    fn test_from_env_with_bucket() {
        std::env::set_var("EMBER_BUCKET", "env-bucket");
        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.bucket(), "env-bucket");
        std::env::remove_var("EMBER_BUCKET");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_yaml_document() {
        let yaml = r#"
bucket: travel
network:
  addresses: ["127.0.0.1:11210"]
  heartbeat-interval-ms: 1000
  idle-timeout-ms: 4000
security:
  username: app
  password: secret
transactions:
  durability: persist-to-majority
"#;
        let config = ClientConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.bucket(), "travel");
        assert_eq!(config.network().heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.security().username(), Some("app"));
        assert_eq!(
            config.transactions().durability(),
            DurabilityLevel::PersistToMajority
        );
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_toml_round_trip() {
        let file_config = FileConfig {
            bucket: Some("toml-test".to_string()),
            timeouts: Some(FileTimeoutConfig {
                kv_timeout_ms: Some(1_500),
                ..Default::default()
            }),
            ..Default::default()
        };
        let toml_str = toml_crate::to_string(&file_config).unwrap();
        let config = ClientConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config.bucket(), "toml-test");
        assert_eq!(config.timeouts().kv_timeout(), Duration::from_millis(1_500));
    }
}
