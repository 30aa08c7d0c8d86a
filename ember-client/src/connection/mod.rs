//! Connection management for the ember client.

mod connection;
mod discovery;
mod endpoint;
mod handshake;
mod manager;
mod pool;

pub use connection::{Connection, ConnectionId};
pub use discovery::{ClusterDiscovery, StaticAddressDiscovery, DEFAULT_KV_PORT};
pub use endpoint::{Endpoint, EndpointState, PendingResponse};
pub use handshake::{Handshake, NegotiatedFeatures};
pub use manager::{ConnectionEvent, ConnectionManager, Route};
pub use pool::NodePool;
