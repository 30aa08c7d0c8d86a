//! Bootstrap, routing and topology tracking over pooled node connections.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::instrument;

use ember_core::protocol::{Outcome, Request, ResponseBody, Status};
use ember_core::{CollectionName, EmberError, Result};

use super::connection::{Connection, ConnectionId};
use super::discovery::{ClusterDiscovery, StaticAddressDiscovery};
use super::endpoint::{EndpointSettings, EndpointState, PendingResponse};
use super::handshake::NegotiatedFeatures;
use super::pool::NodePool;
use crate::cluster::{CollectionManifest, Topology, TopologyHandle};
use crate::config::ClientConfig;
use crate::diagnostics::PingReport;

/// Events emitted during connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection to a node is ready for requests.
    Connected {
        /// The connection identifier.
        id: ConnectionId,
        /// The address of the node.
        address: SocketAddr,
    },
    /// A connection to a node was lost.
    Disconnected {
        /// The connection identifier.
        id: ConnectionId,
        /// The address of the node.
        address: SocketAddr,
        /// The error that caused disconnection, if any.
        error: Option<String>,
    },
    /// Attempting to reconnect to a node.
    ReconnectAttempt {
        /// The address being reconnected.
        address: SocketAddr,
        /// The current attempt number.
        attempt: u32,
        /// The delay before this attempt.
        next_delay: Duration,
    },
    /// Reconnect attempts were exhausted; the node is excluded from routing.
    NodeUnreachable {
        /// The address of the node.
        address: SocketAddr,
        /// The error from the last attempt.
        error: String,
    },
    /// A reachability check of an unreachable node succeeded.
    NodeRecovered {
        /// The address of the node.
        address: SocketAddr,
    },
    /// A newer topology snapshot was installed.
    TopologyUpdated {
        /// Revision that was replaced.
        previous_rev: u64,
        /// Revision now in effect.
        rev: u64,
    },
}

/// Where a key goes under a given topology revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// vbucket the key hashes to.
    pub vbucket: u16,
    /// Node owning the active copy.
    pub address: SocketAddr,
    /// Topology revision the route was computed from.
    pub rev: u64,
}

struct Bootstrapped {
    connection: Connection,
    features: NegotiatedFeatures,
    topology: Topology,
    manifest: CollectionManifest,
}

/// Manages pooled connections to the nodes of one bucket.
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    settings: EndpointSettings,
    topology: TopologyHandle,
    manifest: RwLock<Arc<CollectionManifest>>,
    pools: RwLock<HashMap<SocketAddr, Arc<NodePool>>>,
    collections_enabled: bool,
    origin: IpAddr,
    event_sender: broadcast::Sender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    refresh: Arc<Notify>,
    poll_cursor: AtomicUsize,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("bucket", &self.config.bucket())
            .field("rev", &self.topology.load().rev())
            .field("nodes", &self.pools.read().len())
            .finish_non_exhaustive()
    }
}

async fn fetch_config(connection: &mut Connection) -> Result<Topology> {
    let response = connection.request(&Request::GetClusterConfig).await?;
    match response.outcome {
        Outcome::Success(ResponseBody::Value(body)) => {
            Topology::parse(&body, connection.address().ip())
        }
        Outcome::Success(_) => Err(EmberError::Protocol(
            "cluster config response without a body".to_string(),
        )),
        Outcome::Failure { status, .. } => Err(EmberError::Bootstrap(format!(
            "cluster config unavailable: {}",
            status
        ))),
        Outcome::ProtocolError { reason } => Err(EmberError::Protocol(reason)),
    }
}

async fn fetch_manifest(connection: &mut Connection) -> Result<CollectionManifest> {
    let response = connection.request(&Request::GetCollectionsManifest).await?;
    match response.outcome {
        Outcome::Success(ResponseBody::Value(body)) => CollectionManifest::parse(&body),
        Outcome::Success(_) => Err(EmberError::Protocol(
            "collections manifest response without a body".to_string(),
        )),
        Outcome::Failure {
            status: Status::UnknownCommand | Status::NotSupported,
            ..
        } => Ok(CollectionManifest::default_only()),
        Outcome::Failure { status, .. } => Err(EmberError::Bootstrap(format!(
            "collections manifest unavailable: {}",
            status
        ))),
        Outcome::ProtocolError { reason } => Err(EmberError::Protocol(reason)),
    }
}

async fn bootstrap_node(address: SocketAddr, settings: &EndpointSettings) -> Result<Bootstrapped> {
    let mut connection =
        Connection::connect(address, settings.connect_timeout, settings.max_frame_size).await?;
    let features = settings.handshake.perform(&mut connection).await?;
    let topology = fetch_config(&mut connection).await?;
    let manifest = if features.collections() {
        fetch_manifest(&mut connection).await?
    } else {
        CollectionManifest::default_only()
    };
    Ok(Bootstrapped {
        connection,
        features,
        topology,
        manifest,
    })
}

fn shutdown_requested(
    changed: std::result::Result<(), watch::error::RecvError>,
    rx: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *rx.borrow()
}

impl ConnectionManager {
    /// Bootstraps from the configured addresses.
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>> {
        let discovery = StaticAddressDiscovery::new(config.network().addresses().to_vec());
        Self::connect_with_discovery(config, &discovery).await
    }

    /// Bootstraps from the addresses `discovery` returns.
    ///
    /// Each seed is tried in order until one completes the handshake and
    /// serves a cluster configuration. Fails with [`EmberError::Bootstrap`]
    /// when none does.
    #[instrument(
        name = "connection_manager.connect",
        skip(config, discovery),
        fields(bucket = %config.bucket())
    )]
    pub async fn connect_with_discovery(
        config: ClientConfig,
        discovery: &dyn ClusterDiscovery,
    ) -> Result<Arc<Self>> {
        let addresses = discovery.discover().await?;
        if addresses.is_empty() {
            tracing::error!("no bootstrap addresses discovered");
            return Err(EmberError::Bootstrap(
                "no bootstrap addresses configured".to_string(),
            ));
        }

        let settings = EndpointSettings::from_config(&config);
        let bootstrap_timeout = config.timeouts().bootstrap_timeout();
        let mut failures = Vec::new();

        for address in addresses {
            match timeout(bootstrap_timeout, bootstrap_node(address, &settings)).await {
                Ok(Ok(bootstrapped)) => {
                    tracing::info!(
                        address = %address,
                        rev = bootstrapped.topology.rev(),
                        nodes = bootstrapped.topology.nodes().len(),
                        "bootstrap complete"
                    );
                    return Ok(Self::from_bootstrap(config, settings, bootstrapped));
                }
                Ok(Err(e)) => {
                    tracing::warn!(address = %address, error = %e, "bootstrap attempt failed");
                    failures.push(format!("{}: {}", address, e));
                }
                Err(_) => {
                    tracing::warn!(address = %address, timeout = ?bootstrap_timeout, "bootstrap attempt timed out");
                    failures.push(format!("{}: timed out after {:?}", address, bootstrap_timeout));
                }
            }
        }

        Err(EmberError::Bootstrap(format!(
            "no bootstrap node usable ({})",
            failures.join("; ")
        )))
    }

    fn from_bootstrap(
        config: ClientConfig,
        settings: EndpointSettings,
        bootstrapped: Bootstrapped,
    ) -> Arc<Self> {
        let Bootstrapped {
            connection,
            features,
            topology,
            manifest,
        } = bootstrapped;

        let (event_sender, _) = broadcast::channel(256);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let origin = connection.address().ip();
        let seed_address = connection.address();
        let pool_size = config.network().connections_per_node();

        let mut seed = Some(connection);
        let mut pools = HashMap::new();
        for &address in topology.nodes() {
            let seed = if address == seed_address { seed.take() } else { None };
            pools.insert(
                address,
                Arc::new(NodePool::spawn(address, pool_size, &settings, &event_sender, seed)),
            );
        }
        if seed.is_some() {
            tracing::debug!(address = %seed_address, "bootstrap node is not part of the topology");
        }

        let poll_interval = config.network().config_poll_interval();
        let manager = Arc::new(Self {
            config: Arc::new(config),
            settings,
            topology: TopologyHandle::new(topology),
            manifest: RwLock::new(Arc::new(manifest)),
            pools: RwLock::new(pools),
            collections_enabled: features.collections(),
            origin,
            event_sender,
            shutdown,
            refresh: Arc::new(Notify::new()),
            poll_cursor: AtomicUsize::new(0),
        });

        tokio::spawn(poll_config(
            Arc::downgrade(&manager),
            Arc::clone(&manager.refresh),
            shutdown_rx,
            poll_interval,
        ));

        manager
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_sender.subscribe()
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load()
    }

    /// Returns `true` if keys are sent with a collection id prefix.
    pub fn collections_enabled(&self) -> bool {
        self.collections_enabled
    }

    /// Maps a raw document key to its node under the current topology.
    ///
    /// Pure lookup against the current snapshot; never waits on I/O. Fails
    /// with [`EmberError::NodeUnavailable`] if the owner is unassigned or
    /// currently unreachable.
    pub fn route(&self, key: &[u8]) -> Result<Route> {
        let topology = self.topology.load();
        let vbucket = topology.vbucket_for(key);
        let address = topology.active_node(vbucket).ok_or_else(|| {
            EmberError::NodeUnavailable(format!("vbucket {} has no active node", vbucket))
        })?;

        if let Some(pool) = self.pools.read().get(&address) {
            if !pool.is_reachable() {
                return Err(EmberError::NodeUnavailable(format!(
                    "{} owning vbucket {} is unreachable",
                    address, vbucket
                )));
            }
        }

        Ok(Route {
            vbucket,
            address,
            rev: topology.rev(),
        })
    }

    /// Queues `frame` on one of `address`'s connections.
    ///
    /// If the connection is reconnecting the frame waits in its queue and is
    /// written, in submission order, once the replacement is up.
    pub async fn send(
        &self,
        address: SocketAddr,
        frame: ember_core::protocol::Frame,
    ) -> Result<PendingResponse> {
        let pool = self.pools.read().get(&address).cloned();
        match pool {
            Some(pool) => pool.submit(frame).await,
            None => Err(EmberError::NodeUnavailable(format!(
                "{} is not part of the current topology",
                address
            ))),
        }
    }

    /// Parses a configuration body (from a poll or a `NotMyVbucket` reply)
    /// and installs it if it is newer. Returns `true` on a swap.
    pub fn apply_config(&self, body: &[u8]) -> bool {
        match Topology::parse(body, self.origin) {
            Ok(topology) => self.apply_topology(topology),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparsable cluster config");
                false
            }
        }
    }

    /// Installs `topology` if its revision is newer, reconciling node pools.
    #[instrument(
        name = "connection_manager.apply_topology",
        skip(self, topology),
        fields(rev = topology.rev())
    )]
    pub fn apply_topology(&self, topology: Topology) -> bool {
        let rev = topology.rev();
        let Some(previous) = self.topology.swap_if_newer(topology) else {
            return false;
        };

        self.reconcile_pools();
        tracing::info!(previous_rev = previous.rev(), rev, "topology updated");
        let _ = self.event_sender.send(ConnectionEvent::TopologyUpdated {
            previous_rev: previous.rev(),
            rev,
        });
        true
    }

    fn reconcile_pools(&self) {
        let mut pools = self.pools.write();
        let current = self.topology.load();
        let pool_size = self.config.network().connections_per_node();

        pools.retain(|address, pool| {
            let keep = current.nodes().contains(address);
            if !keep {
                tracing::info!(address = %address, "node left topology");
                pool.shutdown();
            }
            keep
        });
        for &address in current.nodes() {
            pools.entry(address).or_insert_with(|| {
                tracing::info!(address = %address, "node joined topology");
                Arc::new(NodePool::spawn(
                    address,
                    pool_size,
                    &self.settings,
                    &self.event_sender,
                    None,
                ))
            });
        }
    }

    /// Asks the config poller to fetch a configuration now.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Resolves a collection name to the id sent on the wire.
    ///
    /// Unknown names trigger one manifest refresh before failing with
    /// [`EmberError::UnknownCollection`].
    pub async fn resolve_collection(&self, name: &CollectionName) -> Result<u32> {
        if !self.collections_enabled {
            return if name.is_default() {
                Ok(0)
            } else {
                Err(EmberError::UnknownCollection(format!(
                    "{} (collections are not supported by the cluster)",
                    name
                )))
            };
        }

        if let Some(id) = self.manifest.read().collection_id(name) {
            return Ok(id);
        }
        self.refresh_manifest().await?;
        self.manifest
            .read()
            .collection_id(name)
            .ok_or_else(|| EmberError::UnknownCollection(name.to_string()))
    }

    /// Fetches the collection manifest from any reachable node.
    pub async fn refresh_manifest(&self) -> Result<()> {
        let body = self.fetch_from_any(Request::GetCollectionsManifest).await?;
        let manifest = CollectionManifest::parse(&body)?;
        let mut current = self.manifest.write();
        if manifest.uid() >= current.uid() {
            tracing::debug!(uid = manifest.uid(), "collections manifest updated");
            *current = Arc::new(manifest);
        }
        Ok(())
    }

    async fn poll_once(&self) {
        match self.fetch_from_any(Request::GetClusterConfig).await {
            Ok(body) => {
                self.apply_config(&body);
            }
            Err(e) => tracing::debug!(error = %e, "config poll failed"),
        }
    }

    async fn fetch_from_any(&self, request: Request) -> Result<bytes::Bytes> {
        let pools: Vec<Arc<NodePool>> = self
            .pools
            .read()
            .values()
            .filter(|p| p.is_reachable())
            .cloned()
            .collect();
        if pools.is_empty() {
            return Err(EmberError::NodeUnavailable("no reachable nodes".to_string()));
        }

        let pool = &pools[self.poll_cursor.fetch_add(1, Ordering::Relaxed) % pools.len()];
        let mut pending = pool.submit(request.encode(0, 0)?).await?;
        let frame = timeout(self.config.timeouts().kv_timeout(), pending.recv())
            .await
            .map_err(|_| EmberError::Timeout(format!("{} timed out", request.opcode())))??;

        match ember_core::protocol::Response::decode(&frame).outcome {
            Outcome::Success(ResponseBody::Value(body)) => Ok(body),
            Outcome::Success(_) => Err(EmberError::Protocol(format!(
                "{} response without a body",
                request.opcode()
            ))),
            Outcome::Failure { status, .. } => Err(EmberError::UnknownStatus {
                opcode: request.opcode().code(),
                status: status.code(),
            }),
            Outcome::ProtocolError { reason } => Err(EmberError::Protocol(reason)),
        }
    }

    /// Endpoint states per node, for diagnostics.
    pub fn node_states(&self) -> Vec<(SocketAddr, Vec<EndpointState>)> {
        let mut states: Vec<_> = self
            .pools
            .read()
            .iter()
            .map(|(address, pool)| (*address, pool.states()))
            .collect();
        states.sort_by_key(|(address, _)| *address);
        states
    }

    /// Sends a `Noop` on every endpoint of every node, waiting at most `limit`
    /// for each answer.
    pub async fn ping(&self, limit: Duration) -> PingReport {
        let mut pools: Vec<Arc<NodePool>> = self.pools.read().values().cloned().collect();
        pools.sort_by_key(|pool| pool.address());
        let endpoints = join_all(pools.iter().map(|pool| pool.ping(limit)))
            .await
            .into_iter()
            .flatten()
            .collect();
        PingReport { endpoints }
    }

    /// Returns `true` once every node has a connected endpoint.
    pub fn is_ready(&self) -> bool {
        let states = self.node_states();
        !states.is_empty()
            && states
                .iter()
                .all(|(_, endpoints)| endpoints.contains(&EndpointState::Connected))
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Closes every connection and stops background tasks.
    #[instrument(
        name = "connection_manager.shutdown",
        skip(self),
        fields(bucket = %self.config.bucket())
    )]
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let pools: Vec<Arc<NodePool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        tracing::debug!(node_count = pools.len(), "closing node pools");
        for pool in pools {
            pool.shutdown();
        }

        tracing::info!("connection manager shut down");
        Ok(())
    }
}

async fn poll_config(
    manager: Weak<ConnectionManager>,
    refresh: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            _ = refresh.notified() => {}
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.poll_once().await;
    }
    tracing::debug!("config poller stopped");
}
