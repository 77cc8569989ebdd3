//! Pod CIDR discovery for member clusters
//!
//! - Adapters: read the CNI's allocation (Node objects, Calico CRDs, Calico etcd)
//! - Controller: writes the allocation to the cluster's ClusterNodes

pub mod adapter;
pub mod controller;

pub use adapter::{select_adapter, AdapterKind, EtcdDatastoreConfig};
pub use controller::{NodeCidrConfig, NodeCidrController, NodeCidrReconciler};
