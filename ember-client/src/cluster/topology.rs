//! Cluster topology snapshots and the handle they are swapped through.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use ember_core::{vbucket_for_key, EmberError, Result};

const HOST_PLACEHOLDER: &str = "$HOST";

#[derive(Debug, Deserialize)]
struct RawConfig {
    rev: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: RawVbucketServerMap,
}

#[derive(Debug, Deserialize)]
struct RawVbucketServerMap {
    #[serde(rename = "hashAlgorithm", default)]
    hash_algorithm: Option<String>,
    #[serde(rename = "numReplicas", default)]
    num_replicas: usize,
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

/// An immutable view of the cluster: node list plus vbucket ownership.
///
/// A snapshot is never modified after construction. Newer revisions replace
/// it wholesale through [`TopologyHandle::swap_if_newer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    rev: u64,
    bucket: String,
    nodes: Vec<SocketAddr>,
    num_replicas: usize,
    vbucket_map: Vec<Vec<i32>>,
}

impl Topology {
    /// Builds a topology from its parts, validating every node index.
    pub fn new(
        rev: u64,
        bucket: impl Into<String>,
        nodes: Vec<SocketAddr>,
        num_replicas: usize,
        vbucket_map: Vec<Vec<i32>>,
    ) -> Result<Self> {
        if vbucket_map.is_empty() || vbucket_map.len() > u16::MAX as usize {
            return Err(EmberError::Protocol(format!(
                "vbucket map has an invalid size of {}",
                vbucket_map.len()
            )));
        }
        for (vbucket, chain) in vbucket_map.iter().enumerate() {
            for &index in chain {
                if index >= nodes.len() as i32 {
                    return Err(EmberError::Protocol(format!(
                        "vbucket {} references node {} of {}",
                        vbucket,
                        index,
                        nodes.len()
                    )));
                }
            }
        }
        Ok(Self {
            rev,
            bucket: bucket.into(),
            nodes,
            num_replicas,
            vbucket_map,
        })
    }

    /// Parses a cluster configuration document.
    ///
    /// `$HOST` in the server list is replaced by `origin`, the address of the
    /// node that served the document.
    pub fn parse(json: &[u8], origin: IpAddr) -> Result<Self> {
        let raw: RawConfig = serde_json::from_slice(json)
            .map_err(|e| EmberError::Protocol(format!("invalid cluster config: {}", e)))?;

        let map = raw.vbucket_server_map;
        if let Some(algorithm) = &map.hash_algorithm {
            if !algorithm.eq_ignore_ascii_case("crc") {
                return Err(EmberError::Protocol(format!(
                    "unsupported hash algorithm '{}'",
                    algorithm
                )));
            }
        }

        let host = match origin {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        };
        let nodes = map
            .server_list
            .iter()
            .map(|entry| {
                let resolved = entry.replace(HOST_PLACEHOLDER, &host);
                resolved.parse::<SocketAddr>().map_err(|_| {
                    EmberError::Protocol(format!("invalid server address '{}'", entry))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(raw.rev, raw.name, nodes, map.num_replicas, map.vbucket_map)
    }

    /// Revision number; higher is newer.
    pub fn rev(&self) -> u64 {
        self.rev
    }

    /// Bucket this topology describes.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Every node in the server list.
    pub fn nodes(&self) -> &[SocketAddr] {
        &self.nodes
    }

    /// Number of replicas configured per vbucket.
    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Number of vbuckets.
    pub fn vbucket_count(&self) -> u16 {
        self.vbucket_map.len() as u16
    }

    /// The vbucket `key` hashes to.
    pub fn vbucket_for(&self, key: &[u8]) -> u16 {
        vbucket_for_key(key, self.vbucket_count())
    }

    /// Node owning the active copy of `vbucket`, if one is assigned.
    pub fn active_node(&self, vbucket: u16) -> Option<SocketAddr> {
        self.node_at(vbucket, 0)
    }

    /// Nodes holding replicas of `vbucket`, in replica order.
    pub fn replica_nodes(&self, vbucket: u16) -> Vec<SocketAddr> {
        (1..=self.num_replicas)
            .filter_map(|position| self.node_at(vbucket, position))
            .collect()
    }

    fn node_at(&self, vbucket: u16, position: usize) -> Option<SocketAddr> {
        let index = *self.vbucket_map.get(vbucket as usize)?.get(position)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| self.nodes.get(i).copied())
    }
}

/// Shared slot holding the current topology.
///
/// Readers clone the inner `Arc` and route against that snapshot for as long
/// as they need it; a concurrent swap never changes a snapshot in hand.
#[derive(Debug)]
pub struct TopologyHandle {
    current: RwLock<Arc<Topology>>,
}

impl TopologyHandle {
    /// Creates a handle holding `initial`.
    pub fn new(initial: Topology) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Returns the current snapshot.
    pub fn load(&self) -> Arc<Topology> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the snapshot if `candidate` has a higher revision.
    ///
    /// Returns the replaced snapshot when a swap happened.
    pub fn swap_if_newer(&self, candidate: Topology) -> Option<Arc<Topology>> {
        let mut current = self.current.write();
        if candidate.rev <= current.rev {
            return None;
        }
        Some(std::mem::replace(&mut *current, Arc::new(candidate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const CONFIG: &str = r#"{
        "rev": 12,
        "name": "travel",
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["$HOST:11210", "10.0.0.2:11210"],
            "vBucketMap": [[0, 1], [1, 0], [0, -1], [1, -1]]
        }
    }"#;

    fn origin() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn test_parse_substitutes_host() {
        let topology = Topology::parse(CONFIG.as_bytes(), origin()).unwrap();
        assert_eq!(topology.rev(), 12);
        assert_eq!(topology.bucket(), "travel");
        assert_eq!(topology.vbucket_count(), 4);
        assert_eq!(topology.nodes()[0], "10.0.0.1:11210".parse().unwrap());
        assert_eq!(topology.active_node(1), Some("10.0.0.2:11210".parse().unwrap()));
        assert_eq!(topology.replica_nodes(0), vec!["10.0.0.2:11210".parse().unwrap()]);
        assert!(topology.replica_nodes(2).is_empty());
    }

    #[test]
    fn test_parse_brackets_ipv6_host() {
        let origin = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let topology = Topology::parse(CONFIG.as_bytes(), origin).unwrap();
        assert_eq!(topology.nodes()[0], "[::1]:11210".parse().unwrap());
        assert_eq!(topology.nodes()[1], "10.0.0.2:11210".parse().unwrap());
    }

    #[test]
    fn test_parse_rejects_out_of_range_index() {
        let bad = CONFIG.replace("[1, -1]]", "[5, -1]]");
        let err = Topology::parse(bad.as_bytes(), origin()).unwrap_err();
        assert!(err.to_string().contains("references node 5"));
    }

    #[test]
    fn test_parse_rejects_unknown_hash() {
        let bad = CONFIG.replace("\"CRC\"", "\"KETAMA\"");
        assert!(Topology::parse(bad.as_bytes(), origin()).is_err());
    }

    #[test]
    fn test_unassigned_vbucket_has_no_owner() {
        let topology = Topology::new(
            1,
            "b",
            vec!["127.0.0.1:11210".parse().unwrap()],
            0,
            vec![vec![-1], vec![0]],
        )
        .unwrap();
        assert_eq!(topology.active_node(0), None);
        assert!(topology.active_node(1).is_some());
        assert_eq!(topology.active_node(7), None);
    }

    #[test]
    fn test_swap_only_moves_forward() {
        let first = Topology::parse(CONFIG.as_bytes(), origin()).unwrap();
        let handle = TopologyHandle::new(first.clone());

        let held = handle.load();
        let same_rev = first.clone();
        assert!(handle.swap_if_newer(same_rev).is_none());

        let mut newer = first;
        newer.rev = 13;
        newer.vbucket_map.swap(0, 1);
        let replaced = handle.swap_if_newer(newer).unwrap();

        assert_eq!(replaced.rev(), 12);
        assert_eq!(held.rev(), 12);
        assert_eq!(held.active_node(0), Some("10.0.0.1:11210".parse().unwrap()));
        assert_eq!(handle.load().rev(), 13);
        assert_eq!(
            handle.load().active_node(0),
            Some("10.0.0.2:11210".parse().unwrap())
        );
    }
}
