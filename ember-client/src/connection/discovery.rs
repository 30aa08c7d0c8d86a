//! Bootstrap address discovery.

use std::net::SocketAddr;

use async_trait::async_trait;
use ember_core::Result;

/// Default key-value port.
pub const DEFAULT_KV_PORT: u16 = 11210;

/// Trait for discovering the seed nodes a client bootstraps from.
///
/// Only the first reachable seed matters: the full node list comes from the
/// cluster configuration it serves.
#[async_trait]
pub trait ClusterDiscovery: Send + Sync + std::fmt::Debug {
    /// Discovers candidate bootstrap addresses, in preference order.
    async fn discover(&self) -> Result<Vec<SocketAddr>>;
}

/// Static address discovery using a pre-configured list of addresses.
#[derive(Debug, Clone)]
pub struct StaticAddressDiscovery {
    addresses: Vec<SocketAddr>,
}

impl StaticAddressDiscovery {
    /// Creates a new static discovery with the given addresses.
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    /// Creates a static discovery from a single address.
    pub fn from_address(address: SocketAddr) -> Self {
        Self::new(vec![address])
    }

    /// Returns the configured addresses.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }
}

impl Default for StaticAddressDiscovery {
    fn default() -> Self {
        Self::from_address(SocketAddr::from(([127, 0, 0, 1], DEFAULT_KV_PORT)))
    }
}

#[async_trait]
impl ClusterDiscovery for StaticAddressDiscovery {
    async fn discover(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.addresses.clone())
    }
}

impl<T> From<T> for StaticAddressDiscovery
where
    T: IntoIterator<Item = SocketAddr>,
{
    fn from(addresses: T) -> Self {
        Self::new(addresses.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_returns_addresses() {
        let addr1: SocketAddr = "192.168.1.1:11210".parse().unwrap();
        let addr2: SocketAddr = "192.168.1.2:11210".parse().unwrap();

        let discovery = StaticAddressDiscovery::new(vec![addr1, addr2]);
        let result = discovery.discover().await.unwrap();

        assert_eq!(result, vec![addr1, addr2]);
    }

    #[tokio::test]
    async fn test_static_discovery_default() {
        let discovery = StaticAddressDiscovery::default();
        let result = discovery.discover().await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].port(), DEFAULT_KV_PORT);
    }

    #[test]
    fn test_from_iterator() {
        let addrs: Vec<SocketAddr> = vec!["10.0.0.1:11210".parse().unwrap()];
        let discovery = StaticAddressDiscovery::from(addrs.clone());
        assert_eq!(discovery.addresses(), &addrs[..]);
    }
}
