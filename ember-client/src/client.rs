//! Client entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use ember_core::{CollectionName, EmberError, Result};

use crate::collection::Collection;
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, EndpointState};
use crate::diagnostics::{
    CompositeTelemetry, PingReport, SlowOperationDetector, Telemetry, TracingTelemetry,
};
use crate::dispatch::Dispatcher;
use crate::transaction::{ClusterStore, SystemClock, Transactions};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The main entry point for talking to a cluster.
///
/// `Cluster` owns the connections to every node and hands out
/// [`Collection`] handles for KV operations and a [`Transactions`] instance
/// for multi-document transactions.
///
/// # Example
///
/// ```ignore
/// use ember_client::{ClientConfig, Cluster, GetOptions, UpsertOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::builder()
///         .bucket("travel")
///         .add_address("127.0.0.1:11210".parse()?)
///         .credentials("app", "secret")
///         .build()?;
///
///     let cluster = Cluster::connect(config).await?;
///     let hotels = cluster.collection("inventory.hotels".parse()?);
///
///     hotels.upsert("hotel::1", &serde_json::json!({"name": "Ember Inn"}), UpsertOptions::new()).await?;
///     let doc = hotels.get("hotel::1", GetOptions::new()).await?;
///     println!("{}", doc.content_as::<serde_json::Value>()?);
///
///     cluster.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Cluster {
    manager: Arc<ConnectionManager>,
    dispatcher: Dispatcher,
    detector: Arc<SlowOperationDetector>,
    transactions: Mutex<Option<Arc<Transactions>>>,
}

impl Cluster {
    /// Connects to the cluster, logging every operation through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::Bootstrap`](ember_core::EmberError::Bootstrap)
    /// if no configured node completes the handshake, and
    /// [`EmberError::Authentication`](ember_core::EmberError::Authentication)
    /// if the credentials are rejected.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_with_telemetry(config, Arc::new(TracingTelemetry)).await
    }

    /// Connects to the cluster, reporting every operation to `telemetry`.
    ///
    /// Slow operation detection runs alongside `telemetry` as configured in
    /// [`DiagnosticsConfig`](crate::config::DiagnosticsConfig).
    pub async fn connect_with_telemetry(
        config: ClientConfig,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self> {
        let diagnostics = config.diagnostics().clone();
        let bucket = config.bucket().to_string();
        let manager = ConnectionManager::connect(config).await?;

        let detector = Arc::new(
            SlowOperationDetector::new(diagnostics.slow_operation_threshold())
                .with_logging(diagnostics.slow_operation_logging()),
        );
        let sinks = CompositeTelemetry::new()
            .with(telemetry)
            .with(detector.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&manager), Arc::new(sinks));

        tracing::info!(
            bucket = %bucket,
            nodes = manager.topology().nodes().len(),
            "connected to cluster"
        );

        Ok(Self {
            manager,
            dispatcher,
            detector,
            transactions: Mutex::new(None),
        })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        self.manager.config()
    }

    /// Returns a handle to `name` in the configured bucket.
    pub fn collection(&self, name: CollectionName) -> Collection {
        Collection::new(name, self.dispatcher.clone())
    }

    /// Returns a handle to `_default._default`.
    pub fn default_collection(&self) -> Collection {
        self.collection(CollectionName::default())
    }

    /// Returns the transactions instance, creating it on first use.
    pub fn transactions(&self) -> Arc<Transactions> {
        let mut slot = self.transactions.lock();
        if let Some(transactions) = slot.as_ref() {
            return Arc::clone(transactions);
        }
        let config = self.manager.config();
        let transactions = Arc::new(Transactions::start(
            Arc::new(ClusterStore::new(self.dispatcher.clone())),
            config.transactions().clone(),
            config.retry().clone(),
            Arc::new(SystemClock),
            Arc::clone(&self.detector),
        ));
        *slot = Some(Arc::clone(&transactions));
        transactions
    }

    /// Returns the dispatcher for issuing raw protocol operations.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Returns the slow operation detector shared by KV operations and commits.
    pub fn slow_operations(&self) -> &SlowOperationDetector {
        &self.detector
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.manager.subscribe()
    }

    /// Returns the state of every endpoint, grouped by node.
    pub fn diagnostics(&self) -> Vec<(SocketAddr, Vec<EndpointState>)> {
        self.manager.node_states()
    }

    /// Sends a `Noop` on every endpoint and reports each round trip.
    ///
    /// Each endpoint waits at most the configured KV timeout. Endpoints that
    /// do not answer are reported with an error instead of failing the call.
    pub async fn ping(&self) -> PingReport {
        let limit = self.manager.config().timeouts().kv_timeout();
        self.manager.ping(limit).await
    }

    /// Waits until every node in the topology has a connected endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::Timeout`] if that does not happen within `limit`.
    pub async fn wait_until_ready(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        let mut events = self.manager.subscribe();
        loop {
            if self.manager.is_ready() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EmberError::Timeout(format!(
                    "cluster not ready after {:?}: {:?}",
                    limit,
                    self.manager.node_states()
                )));
            }
            let wait = (deadline - now).min(READY_POLL_INTERVAL);
            tokio::select! {
                _ = events.recv() => {}
                _ = sleep(wait) => {}
            }
        }
    }

    /// Number of nodes in the current topology.
    pub fn node_count(&self) -> usize {
        self.manager.topology().nodes().len()
    }

    /// Stops transaction cleanup and closes every connection.
    pub async fn shutdown(&self) -> Result<()> {
        let transactions = self.transactions.lock().take();
        if let Some(transactions) = transactions {
            transactions.close().await;
        }
        self.manager.shutdown().await
    }
}
