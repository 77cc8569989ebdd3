//! Custom Resource Definitions for the ClusterLink control plane
//!
//! This module contains all CRD types:
//! - Cluster: Member cluster and its overlay network options
//! - ClusterNode: Member-cluster node with role, addresses and pod CIDRs
//! - NodeConfig: Computed per-node network primitives

pub mod cluster;
pub mod cluster_node;
pub mod node_config;

pub use cluster::*;
pub use cluster_node::*;
pub use node_config::*;
