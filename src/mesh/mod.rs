//! Peer mesh networking module using Chitchat.
//!
//! Nodes gossip membership and their per-key counter contributions, and
//! agree on which node is authoritative for a counter key.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, Owner};
