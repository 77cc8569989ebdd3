//! Node CIDR Controller
//!
//! Keeps `ClusterNode.spec.podCIDRs` of one member cluster in line with what
//! its CNI allocated. Keys are ClusterNode names (from ClusterNode events)
//! or bare Kubernetes node names (from CNI adapter events that could not be
//! matched to a ClusterNode yet).

use super::adapter::{
    dispatch_requeues, select_adapter, AdapterKind, CalicoAdapter, CalicoEtcdAdapter,
    CommonAdapter, EtcdDatastoreConfig, EVENT_BUFFER,
};
use crate::controllers::stores::{drive_watch, KubeClusterNodeUpdater, KubeClusterNodes, KubeNodes};
use crate::controllers::worker::{Action, AsyncWorker, Reconciler};
use crate::crd::{cluster_node_name, Cluster, ClusterNode};
use crate::domain::{ClusterNodeLister, ClusterNodeUpdater, CniAdapter, NodeLister};
use crate::error::{Error, Result, DEFAULT_REQUEUE_DELAY};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{reflector, watcher};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Node CIDR controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeCidrConfig {
    /// Member cluster whose nodes are tracked
    pub cluster_name: String,
    /// Concurrent reconcile tasks
    pub workers: usize,
    /// Delay of soft waits and failed reconciles
    #[serde(with = "duration_secs")]
    pub requeue_delay: Duration,
    /// Calico etcd datastore, when Calico does not use the Kubernetes API
    pub etcd: Option<EtcdDatastoreConfig>,
}

impl Default for NodeCidrConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            workers: 2,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            etcd: None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Two-phase reconcile of one key
pub struct NodeCidrReconciler {
    cluster_name: String,
    requeue_delay: Duration,
    cluster_nodes: Arc<dyn ClusterNodeLister>,
    nodes: Arc<dyn NodeLister>,
    adapter: Arc<dyn CniAdapter>,
    updater: Arc<dyn ClusterNodeUpdater>,
}

impl NodeCidrReconciler {
    pub fn new(
        cluster_name: impl Into<String>,
        requeue_delay: Duration,
        cluster_nodes: Arc<dyn ClusterNodeLister>,
        nodes: Arc<dyn NodeLister>,
        adapter: Arc<dyn CniAdapter>,
        updater: Arc<dyn ClusterNodeUpdater>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            requeue_delay,
            cluster_nodes,
            nodes,
            adapter,
            updater,
        }
    }

    /// Resolve a key naming a Kubernetes node to its ClusterNode
    async fn resolve_node_name(&self, node_name: &str) -> Result<Option<ClusterNode>> {
        let cidrs = self.adapter.get_cidr_by_node_name(node_name).await?;
        if cidrs.is_empty() && !self.nodes.exists(node_name) {
            info!(node = %node_name, "Node not found, might be removed");
            return Ok(None);
        }

        let canonical = cluster_node_name(&self.cluster_name, node_name);
        match self.cluster_nodes.get(&canonical) {
            Some(cluster_node) => Ok(Some(cluster_node)),
            None => Err(Error::ResourceNotFound {
                kind: "ClusterNode".into(),
                name: canonical,
            }),
        }
    }
}

#[async_trait]
impl Reconciler for NodeCidrReconciler {
    fn name(&self) -> &'static str {
        "nodecidr"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        debug!(key, "Reconciling ClusterNode");

        let cluster_node = match self.cluster_nodes.get(key) {
            Some(cluster_node) => cluster_node,
            None if !self.adapter.synced() => {
                info!(adapter = self.adapter.name(), key, "CNI adapter has not synced yet");
                return Ok(Action::RequeueAfter(self.requeue_delay));
            }
            None => match self.resolve_node_name(key).await {
                Ok(Some(cluster_node)) => cluster_node,
                Ok(None) => return Ok(Action::Done),
                Err(e) if e.is_not_found() => {
                    debug!(key, error = %e, "ClusterNode not created yet");
                    return Ok(Action::RequeueAfter(self.requeue_delay));
                }
                Err(e) => return Err(e),
            },
        };

        let spec = &cluster_node.spec;
        if spec.node_name.is_empty() || spec.cluster_name.is_empty() {
            info!(clusternode = %cluster_node.name(), "ClusterNode has not been synced yet");
            return Ok(Action::RequeueAfter(self.requeue_delay));
        }
        if !self.adapter.synced() {
            info!(adapter = self.adapter.name(), "CNI adapter has not synced yet");
            return Ok(Action::RequeueAfter(self.requeue_delay));
        }

        let pod_cidrs = self.adapter.get_cidr_by_node_name(&spec.node_name).await?;
        if same_cidrs(&pod_cidrs, &spec.pod_cidrs) {
            debug!(clusternode = %cluster_node.name(), "Pod CIDRs unchanged");
            return Ok(Action::Done);
        }

        self.updater
            .update_pod_cidrs(cluster_node.name(), pod_cidrs.clone())
            .await?;
        info!(
            clusternode = %cluster_node.name(),
            cidrs = ?pod_cidrs,
            "Updated pod CIDRs"
        );
        Ok(Action::Done)
    }
}

/// Whether two CIDR lists hold the same set, whatever their order
fn same_cidrs(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

// =============================================================================
// Controller
// =============================================================================

/// Wires watches, the CNI adapter and the work queue for one member cluster
pub struct NodeCidrController {
    config: NodeCidrConfig,
    /// Cluster holding the Cluster and ClusterNode objects
    control_plane: Client,
    /// The member cluster itself
    member: Client,
}

impl NodeCidrController {
    pub fn new(config: NodeCidrConfig, control_plane: Client, member: Client) -> Self {
        Self {
            config,
            control_plane,
            member,
        }
    }

    fn build_adapter(
        &self,
        cni: &str,
        events: mpsc::Sender<String>,
    ) -> Result<Arc<dyn CniAdapter>> {
        let adapter: Arc<dyn CniAdapter> = match select_adapter(cni, self.config.etcd.is_some()) {
            AdapterKind::CalicoEtcd => {
                let etcd = self.config.etcd.clone().unwrap_or_default();
                Arc::new(CalicoEtcdAdapter::from_config(etcd, events)?)
            }
            AdapterKind::Calico => Arc::new(CalicoAdapter::new(self.member.clone(), events)),
            AdapterKind::Common => Arc::new(CommonAdapter::new(self.member.clone(), events)),
        };
        Ok(adapter)
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let cluster_name = self.config.cluster_name.clone();
        let clusters: Api<Cluster> = Api::all(self.control_plane.clone());
        let cluster = clusters.get(&cluster_name).await?;
        info!(cluster = %cluster_name, cni = %cluster.cni(), "Starting node CIDR controller");

        let worker = Arc::new(AsyncWorker::new(self.config.requeue_delay));

        // ClusterNodes of this cluster feed the queue directly
        let cluster_node_api: Api<ClusterNode> = Api::all(self.control_plane.clone());
        let (cluster_node_store, writer) = reflector::store();
        let stream = reflector::reflector(
            writer,
            watcher::watcher(cluster_node_api.clone(), watcher::Config::default()),
        );
        tokio::spawn({
            let worker = Arc::clone(&worker);
            let cluster_name = cluster_name.clone();
            let cancel = cancel.clone();
            async move {
                drive_watch(stream, "ClusterNode", cancel, |event| {
                    let enqueue = |cn: &ClusterNode| {
                        if cn.spec.cluster_name == cluster_name {
                            worker.add(cn.name());
                        }
                    };
                    match event {
                        watcher::Event::Applied(cn) | watcher::Event::Deleted(cn) => enqueue(cn),
                        watcher::Event::Restarted(cns) => cns.iter().for_each(enqueue),
                    }
                })
                .await
            }
        });

        let node_api: Api<Node> = Api::all(self.member.clone());
        let (node_store, writer) = reflector::store();
        let stream = reflector::reflector(
            writer,
            watcher::watcher(node_api, watcher::Config::default()),
        );
        tokio::spawn(drive_watch(stream, "Node", cancel.clone(), |_| {}));

        cluster_node_store
            .wait_until_ready()
            .await
            .map_err(|e| Error::Internal(format!("ClusterNode cache: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let adapter = self.build_adapter(cluster.cni(), events_tx)?;
        adapter.start(cancel.clone()).await?;

        let cluster_nodes: Arc<dyn ClusterNodeLister> =
            Arc::new(KubeClusterNodes(cluster_node_store));
        tokio::spawn(dispatch_requeues(
            events_rx,
            cluster_name.clone(),
            Arc::clone(&cluster_nodes),
            Arc::clone(&worker),
            cancel.clone(),
        ));

        let reconciler = Arc::new(NodeCidrReconciler::new(
            cluster_name.clone(),
            self.config.requeue_delay,
            cluster_nodes,
            Arc::new(KubeNodes(node_store)),
            adapter,
            Arc::new(KubeClusterNodeUpdater::new(cluster_node_api)),
        ));
        worker.run(self.config.workers, reconciler, cancel).await;

        info!(cluster = %cluster_name, "Node CIDR controller stopped");
        Ok(())
    }
}
