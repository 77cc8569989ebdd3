//! ClusterLink Manager - Multi-cluster overlay control plane
//!
//! Discovers the pod CIDRs of every member cluster and computes, for every
//! node, the VXLAN devices, routes, FDB/ARP entries, iptables rules, IPSec
//! material and ipsets that wire it to all other clusters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         Member Clusters                                      │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Common (Node)  │  │  Calico (CRD)   │  │      Calico (etcd)          │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  NodeCIDR Controller  │ → ClusterNode.spec.podCIDRs    │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                         Control Plane                                        │
//! │  Cluster + ClusterNode ──► Filter ──► Handler Pipeline ──► NodeConfig        │
//! │                                                                              │
//! │  InitNodes → VxLocalNetwork → VxBridgeNetwork → ServiceRoutes → PodRoutes    │
//! │  → VxLocalMacCache → VxBridgeMacCache → HostNetwork → GlobalMap → CNISupport │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`network`]: Filter, handler pipeline and network manager
//! - [`controllers`]: Work queue, node CIDR and NodeConfig controllers
//! - [`api`]: REST diagnostics
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Port traits at the Kubernetes and datastore seams
//! - [`error`]: Error types and handling

pub mod api;
pub mod controllers;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod network;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig};

pub use controllers::{
    AsyncWorker, FileConfig, MemberCluster, NodeCidrConfig, NodeCidrController,
    NodeConfigController, NodeConfigControllerConfig,
};

pub use crd::{
    Cluster, ClusterLinkOptions, ClusterNode, ClusterNodeSpec, ClusterSpec, IpFamilyType,
    NetworkType, NodeConfig, NodeConfigSpec, NodeConfigStatus, Role,
};

pub use domain::ports::{BlockAffinity, BlockAffinityDatastore, CniAdapter};

pub use error::{Error, ErrorAction, Result};

pub use network::{ManagerConfig, NetworkManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
