//! Cluster state: topology snapshots and collection manifests.

mod manifest;
mod topology;

pub use manifest::CollectionManifest;
pub use topology::{Topology, TopologyHandle};
