//! Active health checks against every endpoint.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::EndpointState;

/// Result of one endpoint's `Noop` round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPing {
    /// Node the endpoint connects to.
    pub address: SocketAddr,
    /// Position of the endpoint in its node's pool.
    pub index: usize,
    /// Endpoint state when the ping finished.
    pub state: EndpointState,
    /// Round-trip time, when the node answered.
    pub latency: Option<Duration>,
    /// Why the ping failed, when it did.
    pub error: Option<String>,
}

impl EndpointPing {
    /// Returns `true` if the node answered the ping.
    pub fn is_ok(&self) -> bool {
        self.latency.is_some()
    }
}

/// Outcome of [`Cluster::ping`](crate::Cluster::ping).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingReport {
    /// Every endpoint, ordered by node address then pool position.
    pub endpoints: Vec<EndpointPing>,
}

impl PingReport {
    /// Returns `true` if every endpoint answered.
    pub fn all_ok(&self) -> bool {
        !self.endpoints.is_empty() && self.endpoints.iter().all(EndpointPing::is_ok)
    }

    /// Endpoints to `address`.
    pub fn for_node(&self, address: SocketAddr) -> impl Iterator<Item = &EndpointPing> {
        self.endpoints.iter().filter(move |e| e.address == address)
    }

    /// Slowest answered round trip.
    pub fn max_latency(&self) -> Option<Duration> {
        self.endpoints.iter().filter_map(|e| e.latency).max()
    }
}
