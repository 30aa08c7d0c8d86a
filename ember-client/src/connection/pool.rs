//! Fixed-size pool of endpoints to one node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;

use tokio::sync::broadcast;

use ember_core::protocol::Frame;
use ember_core::{EmberError, Result};

use super::connection::Connection;
use super::endpoint::{Endpoint, EndpointSettings, EndpointState, PendingResponse};
use super::manager::ConnectionEvent;
use crate::diagnostics::EndpointPing;

/// N endpoints to the same node, chosen round-robin.
#[derive(Debug)]
pub struct NodePool {
    address: SocketAddr,
    endpoints: Vec<Endpoint>,
    next: AtomicUsize,
}

impl NodePool {
    /// Starts `size` endpoints. `seed`, if given, becomes the first endpoint's
    /// initial connection.
    pub(crate) fn spawn(
        address: SocketAddr,
        size: usize,
        settings: &EndpointSettings,
        events: &broadcast::Sender<ConnectionEvent>,
        mut seed: Option<Connection>,
    ) -> Self {
        let endpoints = (0..size.max(1))
            .map(|_| Endpoint::spawn(address, settings.clone(), events.clone(), seed.take()))
            .collect();
        Self {
            address,
            endpoints,
            next: AtomicUsize::new(0),
        }
    }

    /// Node address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of endpoints in the pool.
    pub fn size(&self) -> usize {
        self.endpoints.len()
    }

    /// State of each endpoint.
    pub fn states(&self) -> Vec<EndpointState> {
        self.endpoints.iter().map(Endpoint::state).collect()
    }

    /// Returns `true` while at least one endpoint accepts requests.
    pub fn is_reachable(&self) -> bool {
        self.endpoints.iter().any(|e| e.state().accepts_requests())
    }

    /// Queues `frame` on the next endpoint that accepts requests.
    pub async fn submit(&self, frame: Frame) -> Result<PendingResponse> {
        let size = self.endpoints.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..size {
            let endpoint = &self.endpoints[(start + offset) % size];
            if endpoint.state().accepts_requests() {
                return endpoint.submit(frame).await;
            }
        }
        Err(EmberError::NodeUnavailable(format!(
            "{} is unreachable",
            self.address
        )))
    }

    /// Pings every endpoint concurrently.
    pub(crate) async fn ping(&self, limit: Duration) -> Vec<EndpointPing> {
        join_all(
            self.endpoints
                .iter()
                .enumerate()
                .map(|(index, endpoint)| endpoint.ping(index, limit)),
        )
        .await
    }

    /// Stops every endpoint.
    pub fn shutdown(&self) {
        for endpoint in &self.endpoints {
            endpoint.shutdown();
        }
    }
}
