//! Domain Ports - Core trait definitions for the ClusterLink manager
//!
//! These traits define the boundaries between the reconcile logic and the
//! outside world (Kubernetes caches and APIs, Calico datastores). The kube
//! backed implementations live next to the controllers; tests use in-memory
//! fakes.

use crate::crd::{Cluster, ClusterNode, NodeConfig, NodeConfigSpec};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Calico Types
// =============================================================================

/// Calico's ownership record of one IPAM block
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockAffinity {
    /// Host the block is affine to
    pub node: String,
    /// Block CIDR
    pub cidr: String,
}

/// CIDRs of all blocks affine to `node_name`, sorted and deduplicated
pub fn cidrs_for_node(affinities: &[BlockAffinity], node_name: &str) -> Vec<String> {
    let mut cidrs: Vec<String> = affinities
        .iter()
        .filter(|ba| ba.node == node_name)
        .map(|ba| ba.cidr.clone())
        .collect();
    cidrs.sort();
    cidrs.dedup();
    cidrs
}

// =============================================================================
// CNI Adapter Port
// =============================================================================

/// Pod CIDR discovery for one member cluster.
///
/// Implementations watch their source in the background and push the name of
/// every Kubernetes node whose allocation may have changed to the channel
/// they were built with.
#[async_trait]
pub trait CniAdapter: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &'static str;

    /// Pod CIDRs currently allocated to a node. Unknown nodes have none.
    async fn get_cidr_by_node_name(&self, node_name: &str) -> Result<Vec<String>>;

    /// Start the background watch; returns once it is running
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Whether the first full listing has been observed
    fn synced(&self) -> bool;
}

// =============================================================================
// Listers
// =============================================================================

/// Cached read access to ClusterNodes
pub trait ClusterNodeLister: Send + Sync {
    fn get(&self, name: &str) -> Option<ClusterNode>;

    fn list(&self) -> Vec<ClusterNode>;
}

/// Cached read access to the member cluster's Kubernetes nodes
pub trait NodeLister: Send + Sync {
    fn exists(&self, name: &str) -> bool;
}

// =============================================================================
// Writers
// =============================================================================

/// Writes discovered pod CIDRs back to ClusterNodes
#[async_trait]
pub trait ClusterNodeUpdater: Send + Sync {
    /// Replace `spec.podCIDRs`, retrying on optimistic-concurrency conflicts
    async fn update_pod_cidrs(&self, name: &str, pod_cidrs: Vec<String>) -> Result<()>;
}

// =============================================================================
// Calico Datastore Port
// =============================================================================

/// Calico IPAM datastore outside the cluster (etcd)
#[async_trait]
pub trait BlockAffinityDatastore: Send + Sync {
    /// Every live block affinity
    async fn list_block_affinities(&self) -> Result<Vec<BlockAffinity>>;
}

// =============================================================================
// NodeConfig Publishing Ports
// =============================================================================

/// Point-in-time view of the control-plane objects the pipeline reads
pub trait NetworkSnapshot: Send + Sync {
    fn clusters(&self) -> Vec<Cluster>;

    fn cluster_nodes(&self) -> Vec<ClusterNode>;

    /// NodeConfigs published so far
    fn node_configs(&self) -> Vec<NodeConfig>;
}

/// Publishes computed NodeConfigs
#[async_trait]
pub trait NodeConfigWriter: Send + Sync {
    /// Create or replace the NodeConfig of `node`, keeping `previous` as history
    async fn publish(
        &self,
        node: &str,
        spec: &NodeConfigSpec,
        previous: Option<&NodeConfig>,
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory port implementations for controller tests

    use super::*;
    use crate::error::Error;
    use parking_lot::{Mutex, RwLock};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct FakeAdapter {
        pub cidrs: RwLock<BTreeMap<String, Vec<String>>>,
        pub synced: AtomicBool,
        pub fail: AtomicBool,
    }

    impl FakeAdapter {
        /// Synced adapter holding `(node, cidr)` allocations
        pub fn synced_with(allocations: &[(&str, &str)]) -> Self {
            let adapter = Self::default();
            adapter.synced.store(true, Ordering::SeqCst);
            for (node, cidr) in allocations {
                adapter
                    .cidrs
                    .write()
                    .entry(node.to_string())
                    .or_default()
                    .push(cidr.to_string());
            }
            adapter
        }
    }

    #[async_trait]
    impl CniAdapter for FakeAdapter {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn get_cidr_by_node_name(&self, node_name: &str) -> Result<Vec<String>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Adapter {
                    adapter: "fake".into(),
                    reason: "list failed".into(),
                });
            }
            if !self.synced() {
                return Err(Error::AdapterNotStarted {
                    adapter: "fake".into(),
                });
            }
            Ok(self.cidrs.read().get(node_name).cloned().unwrap_or_default())
        }

        async fn start(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }

        fn synced(&self) -> bool {
            self.synced.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub struct FakeClusterNodes {
        pub items: RwLock<BTreeMap<String, ClusterNode>>,
        pub updates: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FakeClusterNodes {
        pub fn with(nodes: Vec<ClusterNode>) -> Self {
            let fake = Self::default();
            for node in nodes {
                fake.items.write().insert(node.name().to_string(), node);
            }
            fake
        }
    }

    impl ClusterNodeLister for FakeClusterNodes {
        fn get(&self, name: &str) -> Option<ClusterNode> {
            self.items.read().get(name).cloned()
        }

        fn list(&self) -> Vec<ClusterNode> {
            self.items.read().values().cloned().collect()
        }
    }

    #[async_trait]
    impl ClusterNodeUpdater for FakeClusterNodes {
        async fn update_pod_cidrs(&self, name: &str, pod_cidrs: Vec<String>) -> Result<()> {
            let mut items = self.items.write();
            let node = items.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
                kind: "ClusterNode".into(),
                name: name.into(),
            })?;
            node.spec.pod_cidrs = pod_cidrs.clone();
            self.updates.lock().push((name.to_string(), pod_cidrs));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeNodes(pub RwLock<BTreeSet<String>>);

    impl FakeNodes {
        pub fn with(names: &[&str]) -> Self {
            Self(RwLock::new(names.iter().map(|s| s.to_string()).collect()))
        }
    }

    impl NodeLister for FakeNodes {
        fn exists(&self, name: &str) -> bool {
            self.0.read().contains(name)
        }
    }

    #[derive(Default)]
    pub struct FakeSnapshot {
        pub clusters: RwLock<Vec<Cluster>>,
        pub cluster_nodes: RwLock<Vec<ClusterNode>>,
        pub node_configs: RwLock<Vec<NodeConfig>>,
    }

    impl NetworkSnapshot for FakeSnapshot {
        fn clusters(&self) -> Vec<Cluster> {
            self.clusters.read().clone()
        }

        fn cluster_nodes(&self) -> Vec<ClusterNode> {
            self.cluster_nodes.read().clone()
        }

        fn node_configs(&self) -> Vec<NodeConfig> {
            self.node_configs.read().clone()
        }
    }

    /// Records every publication with the spec it replaced
    #[derive(Default)]
    pub struct FakeWriter {
        pub published: Mutex<Vec<(String, Option<NodeConfigSpec>)>>,
        pub fail_node: RwLock<Option<String>>,
    }

    #[async_trait]
    impl NodeConfigWriter for FakeWriter {
        async fn publish(
            &self,
            node: &str,
            _spec: &NodeConfigSpec,
            previous: Option<&NodeConfig>,
        ) -> Result<()> {
            if self.fail_node.read().as_deref() == Some(node) {
                return Err(Error::Internal(format!("publish {} failed", node)));
            }
            self.published
                .lock()
                .push((node.to_string(), previous.map(|p| p.spec.clone())));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeDatastore {
        pub affinities: RwLock<Vec<BlockAffinity>>,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl BlockAffinityDatastore for FakeDatastore {
        async fn list_block_affinities(&self) -> Result<Vec<BlockAffinity>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Datastore("unreachable".into()));
            }
            Ok(self.affinities.read().clone())
        }
    }
}
