//! Client configuration types and builders.

use std::net::SocketAddr;
use std::time::Duration;

use ember_core::{CollectionName, DurabilityLevel};

/// Default bucket name.
const DEFAULT_BUCKET: &str = "default";
/// Default connection timeout.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of connections kept per node.
const DEFAULT_CONNECTIONS_PER_NODE: usize = 2;
/// Default heartbeat interval.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Default idle timeout after which a silent connection is dropped.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
/// Default interval between cluster configuration polls.
const DEFAULT_CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(2500);
/// Default reconnect attempts before a node is marked unreachable.
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
/// Default interval between reachability checks of an unreachable node.
const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Default capacity of each connection's outbound queue.
const DEFAULT_QUEUE_CAPACITY: usize = 2048;
/// Default initial retry backoff.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1);
/// Default maximum retry backoff.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);
/// Default retry multiplier.
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
/// Default jitter fraction applied to each backoff.
const DEFAULT_RETRY_JITTER: f64 = 0.25;
/// Default maximum attempts per operation, including the first.
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default key-value operation timeout.
const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2500);
/// Default timeout for mutations with a durability requirement.
const DEFAULT_KV_DURABLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default overall bootstrap timeout.
const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default transaction expiration.
const DEFAULT_TXN_EXPIRATION: Duration = Duration::from_secs(15);
/// Default interval between lost-attempt cleanup scans.
const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(60);
/// Default number of attempt record slots.
const DEFAULT_ATR_SLOTS: u16 = 64;
/// Default threshold for the slow operation detector.
const DEFAULT_SLOW_OPERATION_THRESHOLD: Duration = Duration::from_millis(500);
/// Default agent name sent during the handshake.
const DEFAULT_USER_AGENT: &str = concat!("ember/", env!("CARGO_PKG_VERSION"));

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for ember_core::EmberError {
    fn from(err: ConfigError) -> Self {
        ember_core::EmberError::Configuration(err.message)
    }
}

/// Network configuration for cluster connections.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    addresses: Vec<SocketAddr>,
    connection_timeout: Duration,
    connections_per_node: usize,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
    config_poll_interval: Duration,
    max_frame_size: usize,
    reconnect_attempts: u32,
    recheck_interval: Duration,
    queue_capacity: usize,
}

impl NetworkConfig {
    /// Creates a new network configuration builder.
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder::new()
    }

    /// Returns the bootstrap addresses.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Returns the TCP connect plus handshake timeout.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Returns the number of connections kept to each node.
    pub fn connections_per_node(&self) -> usize {
        self.connections_per_node
    }

    /// Returns the heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Returns how long a connection may go without inbound traffic.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the cluster configuration poll interval.
    pub fn config_poll_interval(&self) -> Duration {
        self.config_poll_interval
    }

    /// Returns the maximum accepted frame body size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Returns how many reconnects are tried before a node is marked unreachable.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Returns the interval between reachability checks of an unreachable node.
    pub fn recheck_interval(&self) -> Duration {
        self.recheck_interval
    }

    /// Returns the capacity of each connection's outbound queue.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            addresses: vec![SocketAddr::from(([127, 0, 0, 1], 11210))],
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            connections_per_node: DEFAULT_CONNECTIONS_PER_NODE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            config_poll_interval: DEFAULT_CONFIG_POLL_INTERVAL,
            max_frame_size: ember_core::protocol::DEFAULT_MAX_BODY_SIZE,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Builder for `NetworkConfig`.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    addresses: Vec<SocketAddr>,
    connection_timeout: Option<Duration>,
    connections_per_node: Option<usize>,
    heartbeat_interval: Option<Duration>,
    idle_timeout: Option<Duration>,
    config_poll_interval: Option<Duration>,
    max_frame_size: Option<usize>,
    reconnect_attempts: Option<u32>,
    recheck_interval: Option<Duration>,
    queue_capacity: Option<usize>,
}

impl NetworkConfigBuilder {
    /// Creates a new network configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bootstrap address.
    pub fn add_address(mut self, address: SocketAddr) -> Self {
        self.addresses.push(address);
        self
    }

    /// Sets the bootstrap addresses, replacing any previously configured.
    pub fn addresses(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    /// Sets the connection timeout duration.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the number of connections kept to each node.
    pub fn connections_per_node(mut self, count: usize) -> Self {
        self.connections_per_node = Some(count);
        self
    }

    /// Sets the heartbeat interval duration.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the cluster configuration poll interval.
    pub fn config_poll_interval(mut self, interval: Duration) -> Self {
        self.config_poll_interval = Some(interval);
        self
    }

    /// Sets the maximum accepted frame body size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Sets how many reconnects are tried before a node is marked unreachable.
    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = Some(attempts);
        self
    }

    /// Sets the interval between reachability checks of an unreachable node.
    pub fn recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = Some(interval);
        self
    }

    /// Sets the capacity of each connection's outbound queue.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Builds the network configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `connections_per_node` or `queue_capacity` is zero
    /// - `idle_timeout` does not exceed `heartbeat_interval`
    /// - `max_frame_size` is smaller than 1 KiB
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        let defaults = NetworkConfig::default();
        let addresses = if self.addresses.is_empty() {
            defaults.addresses
        } else {
            self.addresses
        };

        let connections_per_node = self
            .connections_per_node
            .unwrap_or(DEFAULT_CONNECTIONS_PER_NODE);
        if connections_per_node == 0 {
            return Err(ConfigError::new("connections_per_node must be at least 1"));
        }

        let queue_capacity = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(ConfigError::new("queue_capacity must be at least 1"));
        }

        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let idle_timeout = self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);
        if idle_timeout <= heartbeat_interval {
            return Err(ConfigError::new(
                "idle_timeout must exceed heartbeat_interval",
            ));
        }

        let max_frame_size = self.max_frame_size.unwrap_or(defaults.max_frame_size);
        if max_frame_size < 1024 {
            return Err(ConfigError::new("max_frame_size must be at least 1024 bytes"));
        }

        Ok(NetworkConfig {
            addresses,
            connection_timeout: self.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            connections_per_node,
            heartbeat_interval,
            idle_timeout,
            config_poll_interval: self
                .config_poll_interval
                .unwrap_or(DEFAULT_CONFIG_POLL_INTERVAL),
            max_frame_size,
            reconnect_attempts: self.reconnect_attempts.unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
            recheck_interval: self.recheck_interval.unwrap_or(DEFAULT_RECHECK_INTERVAL),
            queue_capacity,
        })
    }
}

/// Retry configuration shared by operation retries and reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: u32,
}

impl RetryConfig {
    /// Creates a new retry configuration builder.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Returns the initial backoff duration.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the maximum backoff duration.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the backoff multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the jitter fraction in `[0, 1]`.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Returns the maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: DEFAULT_RETRY_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl From<RetryConfig> for RetryConfigBuilder {
    fn from(config: RetryConfig) -> Self {
        Self {
            initial_backoff: Some(config.initial_backoff),
            max_backoff: Some(config.max_backoff),
            multiplier: Some(config.multiplier),
            jitter: Some(config.jitter),
            max_attempts: Some(config.max_attempts),
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    max_attempts: Option<u32>,
}

impl RetryConfigBuilder {
    /// Creates a new retry configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial backoff duration.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Sets the maximum backoff duration.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Sets the backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the jitter fraction.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Sets the maximum number of attempts, including the first.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Builds the retry configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `initial_backoff` exceeds `max_backoff`
    /// - `multiplier` is less than 1.0
    /// - `jitter` is outside `[0, 1]`
    /// - `max_attempts` is zero
    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        let initial_backoff = self.initial_backoff.unwrap_or(DEFAULT_INITIAL_BACKOFF);
        let max_backoff = self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF);
        let multiplier = self.multiplier.unwrap_or(DEFAULT_RETRY_MULTIPLIER);
        let jitter = self.jitter.unwrap_or(DEFAULT_RETRY_JITTER);
        let max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        if initial_backoff > max_backoff {
            return Err(ConfigError::new(
                "initial_backoff must not exceed max_backoff",
            ));
        }

        if multiplier < 1.0 {
            return Err(ConfigError::new("multiplier must be at least 1.0"));
        }

        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::new("jitter must be between 0.0 and 1.0"));
        }

        if max_attempts == 0 {
            return Err(ConfigError::new("max_attempts must be at least 1"));
        }

        Ok(RetryConfig {
            initial_backoff,
            max_backoff,
            multiplier,
            jitter,
            max_attempts,
        })
    }
}

/// Per-service timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    kv_timeout: Duration,
    kv_durable_timeout: Duration,
    bootstrap_timeout: Duration,
}

impl TimeoutConfig {
    /// Returns the default key-value operation timeout.
    pub fn kv_timeout(&self) -> Duration {
        self.kv_timeout
    }

    /// Returns the timeout for mutations with a durability requirement.
    pub fn kv_durable_timeout(&self) -> Duration {
        self.kv_durable_timeout
    }

    /// Returns the overall bootstrap timeout.
    pub fn bootstrap_timeout(&self) -> Duration {
        self.bootstrap_timeout
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            kv_timeout: DEFAULT_KV_TIMEOUT,
            kv_durable_timeout: DEFAULT_KV_DURABLE_TIMEOUT,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
        }
    }
}

/// Builder for `TimeoutConfig`.
#[derive(Debug, Clone, Default)]
pub struct TimeoutConfigBuilder {
    kv_timeout: Option<Duration>,
    kv_durable_timeout: Option<Duration>,
    bootstrap_timeout: Option<Duration>,
}

impl TimeoutConfigBuilder {
    /// Creates a new timeout configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key-value operation timeout.
    pub fn kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    /// Sets the durable mutation timeout.
    pub fn kv_durable_timeout(mut self, timeout: Duration) -> Self {
        self.kv_durable_timeout = Some(timeout);
        self
    }

    /// Sets the bootstrap timeout.
    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = Some(timeout);
        self
    }

    /// Builds the timeout configuration.
    pub fn build(self) -> Result<TimeoutConfig, ConfigError> {
        let config = TimeoutConfig {
            kv_timeout: self.kv_timeout.unwrap_or(DEFAULT_KV_TIMEOUT),
            kv_durable_timeout: self.kv_durable_timeout.unwrap_or(DEFAULT_KV_DURABLE_TIMEOUT),
            bootstrap_timeout: self.bootstrap_timeout.unwrap_or(DEFAULT_BOOTSTRAP_TIMEOUT),
        };
        if config.kv_timeout.is_zero()
            || config.kv_durable_timeout.is_zero()
            || config.bootstrap_timeout.is_zero()
        {
            return Err(ConfigError::new("timeouts must be greater than zero"));
        }
        Ok(config)
    }
}

/// Security configuration for authentication.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    username: Option<String>,
    password: Option<String>,
}

impl SecurityConfig {
    /// Returns the username if configured.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the password if configured.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Returns `true` if username and password are configured.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Builder for `SecurityConfig`.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfigBuilder {
    username: Option<String>,
    password: Option<String>,
}

impl SecurityConfigBuilder {
    /// Creates a new security configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets both username and password.
    pub fn credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username(username).password(password)
    }

    /// Builds the security configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if only one of username or password is set.
    pub fn build(self) -> Result<SecurityConfig, ConfigError> {
        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::new(
                "username and password must both be set or both be unset",
            ));
        }
        Ok(SecurityConfig {
            username: self.username,
            password: self.password,
        })
    }
}

/// Cluster-wide transaction defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionsConfig {
    expiration: Duration,
    kv_timeout: Option<Duration>,
    durability: DurabilityLevel,
    cleanup_window: Duration,
    cleanup_lost_attempts: bool,
    cleanup_client_attempts: bool,
    metadata_collection: Option<CollectionName>,
    atr_slots: u16,
}

impl TransactionsConfig {
    /// Creates a new transactions configuration builder.
    pub fn builder() -> TransactionsConfigBuilder {
        TransactionsConfigBuilder::new()
    }

    /// Returns how long a transaction may run before it expires.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Returns the timeout for each KV operation a transaction performs, if
    /// overriding the client default.
    pub fn kv_timeout(&self) -> Option<Duration> {
        self.kv_timeout
    }

    /// Returns the durability applied to transactional writes.
    pub fn durability(&self) -> DurabilityLevel {
        self.durability
    }

    /// Returns the interval between lost-attempt cleanup scans.
    pub fn cleanup_window(&self) -> Duration {
        self.cleanup_window
    }

    /// Returns `true` if this client scans for and resolves other clients' expired attempts.
    pub fn cleanup_lost_attempts(&self) -> bool {
        self.cleanup_lost_attempts
    }

    /// Returns `true` if this client finishes its own incomplete attempts in the background.
    pub fn cleanup_client_attempts(&self) -> bool {
        self.cleanup_client_attempts
    }

    /// Returns the collection holding attempt records and staged copies, or
    /// `None` to keep them next to the first mutated document.
    pub fn metadata_collection(&self) -> Option<&CollectionName> {
        self.metadata_collection.as_ref()
    }

    /// Returns the number of attempt record slots.
    pub fn atr_slots(&self) -> u16 {
        self.atr_slots
    }
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            expiration: DEFAULT_TXN_EXPIRATION,
            kv_timeout: None,
            durability: DurabilityLevel::Majority,
            cleanup_window: DEFAULT_CLEANUP_WINDOW,
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            metadata_collection: None,
            atr_slots: DEFAULT_ATR_SLOTS,
        }
    }
}

/// Builder for `TransactionsConfig`.
#[derive(Debug, Clone, Default)]
pub struct TransactionsConfigBuilder {
    expiration: Option<Duration>,
    kv_timeout: Option<Duration>,
    durability: Option<DurabilityLevel>,
    cleanup_window: Option<Duration>,
    cleanup_lost_attempts: Option<bool>,
    cleanup_client_attempts: Option<bool>,
    metadata_collection: Option<CollectionName>,
    atr_slots: Option<u16>,
}

impl TransactionsConfigBuilder {
    /// Creates a new transactions configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transaction expiration.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Sets the per-operation KV timeout used inside transactions.
    pub fn kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    /// Sets the durability of transactional writes.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = Some(durability);
        self
    }

    /// Sets the interval between lost-attempt cleanup scans.
    pub fn cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = Some(window);
        self
    }

    /// Enables or disables lost-attempt cleanup.
    pub fn cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_lost_attempts = Some(enabled);
        self
    }

    /// Enables or disables background completion of this client's attempts.
    pub fn cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = Some(enabled);
        self
    }

    /// Sets the collection for transaction metadata.
    pub fn metadata_collection(mut self, collection: CollectionName) -> Self {
        self.metadata_collection = Some(collection);
        self
    }

    /// Sets the number of attempt record slots.
    pub fn atr_slots(mut self, slots: u16) -> Self {
        self.atr_slots = Some(slots);
        self
    }

    /// Builds the transactions configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the expiration or cleanup window is zero, or
    /// if `atr_slots` is zero.
    pub fn build(self) -> Result<TransactionsConfig, ConfigError> {
        let expiration = self.expiration.unwrap_or(DEFAULT_TXN_EXPIRATION);
        if expiration.is_zero() {
            return Err(ConfigError::new("transaction expiration must be greater than zero"));
        }
        let cleanup_window = self.cleanup_window.unwrap_or(DEFAULT_CLEANUP_WINDOW);
        if cleanup_window.is_zero() {
            return Err(ConfigError::new("cleanup_window must be greater than zero"));
        }
        let atr_slots = self.atr_slots.unwrap_or(DEFAULT_ATR_SLOTS);
        if atr_slots == 0 {
            return Err(ConfigError::new("atr_slots must be at least 1"));
        }

        Ok(TransactionsConfig {
            expiration,
            kv_timeout: self.kv_timeout,
            durability: self.durability.unwrap_or(DurabilityLevel::Majority),
            cleanup_window,
            cleanup_lost_attempts: self.cleanup_lost_attempts.unwrap_or(true),
            cleanup_client_attempts: self.cleanup_client_attempts.unwrap_or(true),
            metadata_collection: self.metadata_collection,
            atr_slots,
        })
    }
}

/// Diagnostics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    slow_operation_threshold: Duration,
    slow_operation_logging: bool,
}

impl DiagnosticsConfig {
    /// Returns the latency above which an operation is reported as slow.
    pub fn slow_operation_threshold(&self) -> Duration {
        self.slow_operation_threshold
    }

    /// Returns `true` if slow operations are logged.
    pub fn slow_operation_logging(&self) -> bool {
        self.slow_operation_logging
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            slow_operation_threshold: DEFAULT_SLOW_OPERATION_THRESHOLD,
            slow_operation_logging: true,
        }
    }
}

/// Builder for `DiagnosticsConfig`.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsConfigBuilder {
    slow_operation_threshold: Option<Duration>,
    slow_operation_logging: Option<bool>,
}

impl DiagnosticsConfigBuilder {
    /// Creates a new diagnostics configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the slow operation threshold.
    pub fn slow_operation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_operation_threshold = Some(threshold);
        self
    }

    /// Enables or disables slow operation logging.
    pub fn slow_operation_logging(mut self, enabled: bool) -> Self {
        self.slow_operation_logging = Some(enabled);
        self
    }

    /// Builds the diagnostics configuration.
    pub fn build(self) -> Result<DiagnosticsConfig, ConfigError> {
        Ok(DiagnosticsConfig {
            slow_operation_threshold: self
                .slow_operation_threshold
                .unwrap_or(DEFAULT_SLOW_OPERATION_THRESHOLD),
            slow_operation_logging: self.slow_operation_logging.unwrap_or(true),
        })
    }
}

/// Main client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    bucket: String,
    user_agent: String,
    network: NetworkConfig,
    retry: RetryConfig,
    timeouts: TimeoutConfig,
    security: SecurityConfig,
    transactions: TransactionsConfig,
    diagnostics: DiagnosticsConfig,
}

impl ClientConfig {
    /// Creates a new client configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the agent name sent during the handshake.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Returns the network configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Returns the retry configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the timeout configuration.
    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Returns the security configuration.
    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    /// Returns the transactions configuration.
    pub fn transactions(&self) -> &TransactionsConfig {
        &self.transactions
    }

    /// Returns the diagnostics configuration.
    pub fn diagnostics(&self) -> &DiagnosticsConfig {
        &self.diagnostics
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            network: NetworkConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            security: SecurityConfig::default(),
            transactions: TransactionsConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    bucket: Option<String>,
    user_agent: Option<String>,
    network: NetworkConfigBuilder,
    retry: RetryConfigBuilder,
    timeouts: TimeoutConfigBuilder,
    security: SecurityConfigBuilder,
    transactions: TransactionsConfigBuilder,
    diagnostics: DiagnosticsConfigBuilder,
}

impl ClientConfigBuilder {
    /// Creates a new client configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bucket name.
    pub fn bucket(mut self, name: impl Into<String>) -> Self {
        self.bucket = Some(name.into());
        self
    }

    /// Sets the agent name sent during the handshake.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Configures network settings using a builder function.
    pub fn network<F>(mut self, f: F) -> Self
    where
        F: FnOnce(NetworkConfigBuilder) -> NetworkConfigBuilder,
    {
        self.network = f(self.network);
        self
    }

    /// Configures retry settings using a builder function.
    pub fn retry<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RetryConfigBuilder) -> RetryConfigBuilder,
    {
        self.retry = f(self.retry);
        self
    }

    /// Configures timeouts using a builder function.
    pub fn timeouts<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TimeoutConfigBuilder) -> TimeoutConfigBuilder,
    {
        self.timeouts = f(self.timeouts);
        self
    }

    /// Configures security settings using a builder function.
    pub fn security<F>(mut self, f: F) -> Self
    where
        F: FnOnce(SecurityConfigBuilder) -> SecurityConfigBuilder,
    {
        self.security = f(self.security);
        self
    }

    /// Configures transaction defaults using a builder function.
    pub fn transactions<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TransactionsConfigBuilder) -> TransactionsConfigBuilder,
    {
        self.transactions = f(self.transactions);
        self
    }

    /// Configures diagnostics using a builder function.
    pub fn diagnostics<F>(mut self, f: F) -> Self
    where
        F: FnOnce(DiagnosticsConfigBuilder) -> DiagnosticsConfigBuilder,
    {
        self.diagnostics = f(self.diagnostics);
        self
    }

    /// Adds a bootstrap address.
    pub fn add_address(mut self, address: SocketAddr) -> Self {
        self.network = self.network.add_address(address);
        self
    }

    /// Sets the bootstrap addresses.
    pub fn addresses(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.network = self.network.addresses(addresses);
        self
    }

    /// Sets credentials for authentication.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.security = self.security.credentials(username, password);
        self
    }

    /// Builds the client configuration, returning an error if validation fails.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let bucket = self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        if bucket.is_empty() {
            return Err(ConfigError::new("bucket must not be empty"));
        }

        Ok(ClientConfig {
            bucket,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            network: self.network.build()?,
            retry: self.retry.build()?,
            timeouts: self.timeouts.build()?,
            security: self.security.build()?,
            transactions: self.transactions.build()?,
            diagnostics: self.diagnostics.build()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.bucket(), "default");
        assert_eq!(config.network().addresses().len(), 1);
        assert_eq!(
            config.network().addresses()[0],
            "127.0.0.1:11210".parse::<SocketAddr>().unwrap()
        );
        assert!(config.user_agent().starts_with("ember/"));
    }

    #[test]
    fn test_builder_matches_default() {
        let built = ClientConfig::builder().build().unwrap();
        let default = ClientConfig::default();
        assert_eq!(built.bucket(), default.bucket());
        assert_eq!(built.retry(), default.retry());
        assert_eq!(built.timeouts(), default.timeouts());
        assert_eq!(built.transactions(), default.transactions());
    }

    #[test]
    fn test_builder_empty_bucket_fails() {
        let result = ClientConfig::builder().bucket("").build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("bucket must not be empty"));
    }

    #[test]
    fn test_builder_addresses_replaces() {
        let addr1: SocketAddr = "10.0.0.1:11210".parse().unwrap();
        let addr2: SocketAddr = "10.0.0.2:11210".parse().unwrap();
        let config = ClientConfig::builder()
            .add_address(addr1)
            .addresses([addr2])
            .build()
            .unwrap();
        assert_eq!(config.network().addresses(), &[addr2]);
    }

    #[test]
    fn test_fluent_sub_builder_api() {
        let config = ClientConfig::builder()
            .bucket("travel")
            .network(|n| {
                n.connections_per_node(4)
                    .heartbeat_interval(Duration::from_secs(1))
                    .idle_timeout(Duration::from_secs(3))
            })
            .retry(|r| r.max_attempts(3).jitter(0.0))
            .timeouts(|t| t.kv_timeout(Duration::from_millis(750)))
            .transactions(|t| t.expiration(Duration::from_secs(5)).atr_slots(8))
            .diagnostics(|d| d.slow_operation_threshold(Duration::from_millis(50)))
            .credentials("admin", "password")
            .build()
            .unwrap();

        assert_eq!(config.bucket(), "travel");
        assert_eq!(config.network().connections_per_node(), 4);
        assert_eq!(config.retry().max_attempts(), 3);
        assert_eq!(config.retry().jitter(), 0.0);
        assert_eq!(config.timeouts().kv_timeout(), Duration::from_millis(750));
        assert_eq!(config.transactions().expiration(), Duration::from_secs(5));
        assert_eq!(config.transactions().atr_slots(), 8);
        assert_eq!(
            config.diagnostics().slow_operation_threshold(),
            Duration::from_millis(50)
        );
        assert!(config.security().has_credentials());
    }

    #[test]
    fn test_network_zero_pool_fails() {
        let result = NetworkConfigBuilder::new().connections_per_node(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_network_idle_must_exceed_heartbeat() {
        let result = NetworkConfigBuilder::new()
            .heartbeat_interval(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(10))
            .build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("idle_timeout must exceed heartbeat_interval"));
    }

    #[test]
    fn test_network_small_frame_size_fails() {
        assert!(NetworkConfigBuilder::new().max_frame_size(100).build().is_err());
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.initial_backoff(), Duration::from_millis(1));
        assert_eq!(config.max_backoff(), Duration::from_millis(500));
        assert_eq!(config.multiplier(), 2.0);
        assert_eq!(config.max_attempts(), 10);
    }

    #[test]
    fn test_retry_initial_exceeds_max_fails() {
        let result = RetryConfigBuilder::new()
            .initial_backoff(Duration::from_secs(2))
            .max_backoff(Duration::from_secs(1))
            .build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("initial_backoff must not exceed max_backoff"));
    }

    #[test]
    fn test_retry_multiplier_less_than_one_fails() {
        assert!(RetryConfigBuilder::new().multiplier(0.5).build().is_err());
    }

    #[test]
    fn test_retry_jitter_out_of_range_fails() {
        assert!(RetryConfigBuilder::new().jitter(1.5).build().is_err());
        assert!(RetryConfigBuilder::new().jitter(-0.1).build().is_err());
        assert!(RetryConfigBuilder::new().jitter(1.0).build().is_ok());
    }

    #[test]
    fn test_retry_zero_attempts_fails() {
        assert!(RetryConfigBuilder::new().max_attempts(0).build().is_err());
    }

    #[test]
    fn test_retry_builder_from_config() {
        let original = RetryConfigBuilder::new().max_attempts(4).build().unwrap();
        let rebuilt = RetryConfigBuilder::from(original.clone()).build().unwrap();
        assert_eq!(original, rebuilt);
    }

    #[test]
    fn test_zero_timeout_fails() {
        assert!(TimeoutConfigBuilder::new()
            .kv_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_security_partial_credentials_fails() {
        assert!(SecurityConfigBuilder::new().username("admin").build().is_err());
        assert!(SecurityConfigBuilder::new().password("secret").build().is_err());
        assert!(!SecurityConfigBuilder::new().build().unwrap().has_credentials());
    }

    #[test]
    fn test_transactions_defaults() {
        let config = TransactionsConfig::default();
        assert_eq!(config.expiration(), Duration::from_secs(15));
        assert_eq!(config.durability(), DurabilityLevel::Majority);
        assert_eq!(config.atr_slots(), 64);
        assert!(config.cleanup_lost_attempts());
        assert!(config.cleanup_client_attempts());
        assert!(config.metadata_collection().is_none());
    }

    #[test]
    fn test_transactions_validation() {
        assert!(TransactionsConfig::builder()
            .expiration(Duration::ZERO)
            .build()
            .is_err());
        assert!(TransactionsConfig::builder().atr_slots(0).build().is_err());
        assert!(TransactionsConfig::builder()
            .cleanup_window(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("bad value");
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn test_config_error_into_ember_error() {
        let err: ember_core::EmberError = ConfigError::new("bad value").into();
        assert!(matches!(err, ember_core::EmberError::Configuration(_)));
    }

    #[test]
    fn test_client_config_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClientConfig>();
        assert_send_sync::<ConfigError>();
    }
}
