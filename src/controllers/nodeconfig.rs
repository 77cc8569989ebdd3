//! NodeConfig Publishing Controller
//!
//! Recomputes the overlay whenever a Cluster or ClusterNode changes and
//! publishes one NodeConfig per node. All changes collapse onto a single
//! queue key, so bursts of events cost one pipeline run.

use crate::controllers::stores::drive_watch;
use crate::controllers::worker::{Action, AsyncWorker, Reconciler};
use crate::crd::{Cluster, ClusterNode, NodeConfig, NodeConfigSpec};
use crate::domain::{NetworkSnapshot, NodeConfigWriter};
use crate::error::{Error, Result, DEFAULT_REQUEUE_DELAY};
use crate::network::NetworkManager;
use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Annotation holding the spec a NodeConfig had before the last change
pub const PREV_ANNOTATION: &str = "prev";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "clusterlink-manager";

/// The one key every change is collapsed onto
const SYNC_KEY: &str = "network";

// =============================================================================
// Configuration
// =============================================================================

/// NodeConfig controller configuration
#[derive(Debug, Clone)]
pub struct NodeConfigControllerConfig {
    pub requeue_delay: Duration,
}

impl Default for NodeConfigControllerConfig {
    fn default() -> Self {
        Self {
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Runs the pipeline over a snapshot and publishes what changed
pub struct NodeConfigReconciler {
    manager: Arc<NetworkManager>,
    snapshot: Arc<dyn NetworkSnapshot>,
    writer: Arc<dyn NodeConfigWriter>,
}

impl NodeConfigReconciler {
    pub fn new(
        manager: Arc<NetworkManager>,
        snapshot: Arc<dyn NetworkSnapshot>,
        writer: Arc<dyn NodeConfigWriter>,
    ) -> Self {
        Self {
            manager,
            snapshot,
            writer,
        }
    }
}

#[async_trait]
impl Reconciler for NodeConfigReconciler {
    fn name(&self) -> &'static str {
        "nodeconfig"
    }

    async fn reconcile(&self, _key: &str) -> Result<Action> {
        let previous = self.snapshot.node_configs();
        let results = self.manager.calculate_network_configs(
            self.snapshot.clusters(),
            self.snapshot.cluster_nodes(),
            previous.clone(),
        )?;

        let previous: BTreeMap<String, NodeConfig> = previous
            .into_iter()
            .filter_map(|nc| nc.metadata.name.clone().map(|name| (name, nc)))
            .collect();

        let mut first_error = None;
        let mut published = 0usize;
        for (node, spec) in &results {
            let prev = previous.get(node);
            if prev.map(|p| &p.spec) == Some(spec) {
                continue;
            }
            match self.writer.publish(node, spec, prev).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(node = %node, error = %e, "Publishing NodeConfig failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            nodes = results.len(),
            published,
            "NodeConfigs reconciled"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(Action::Done),
        }
    }
}

// =============================================================================
// Kubernetes Adapters
// =============================================================================

/// Snapshot served from reflector stores
#[derive(Clone)]
pub struct KubeSnapshot {
    clusters: Store<Cluster>,
    cluster_nodes: Store<ClusterNode>,
    node_configs: Store<NodeConfig>,
}

impl NetworkSnapshot for KubeSnapshot {
    fn clusters(&self) -> Vec<Cluster> {
        self.clusters.state().iter().map(|c| (**c).clone()).collect()
    }

    fn cluster_nodes(&self) -> Vec<ClusterNode> {
        self.cluster_nodes.state().iter().map(|c| (**c).clone()).collect()
    }

    fn node_configs(&self) -> Vec<NodeConfig> {
        self.node_configs.state().iter().map(|c| (**c).clone()).collect()
    }
}

/// Server-side applies NodeConfigs and stamps their change time
#[derive(Clone)]
pub struct KubeNodeConfigWriter {
    api: Api<NodeConfig>,
}

impl KubeNodeConfigWriter {
    pub fn new(api: Api<NodeConfig>) -> Self {
        Self { api }
    }
}

/// Apply body of a NodeConfig, carrying the replaced spec as an annotation
pub fn node_config_patch(
    node: &str,
    spec: &NodeConfigSpec,
    previous: Option<&NodeConfig>,
) -> Result<serde_json::Value> {
    let mut annotations = BTreeMap::new();
    if let Some(prev) = previous {
        annotations.insert(PREV_ANNOTATION.to_string(), serde_json::to_string(&prev.spec)?);
    }
    Ok(json!({
        "apiVersion": "kosmos.io/v1alpha1",
        "kind": "NodeConfig",
        "metadata": {
            "name": node,
            "annotations": annotations,
        },
        "spec": spec,
    }))
}

#[async_trait]
impl NodeConfigWriter for KubeNodeConfigWriter {
    async fn publish(
        &self,
        node: &str,
        spec: &NodeConfigSpec,
        previous: Option<&NodeConfig>,
    ) -> Result<()> {
        let patch = node_config_patch(node, spec, previous)?;
        self.api
            .patch(
                node,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;

        let status = json!({ "status": { "lastChangeTime": Utc::now() } });
        self.api
            .patch_status(node, &PatchParams::default(), &Patch::Merge(&status))
            .await?;

        debug!(node, "Published NodeConfig");
        Ok(())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Watches the control plane and keeps NodeConfigs published
pub struct NodeConfigController {
    config: NodeConfigControllerConfig,
    client: Client,
    manager: Arc<NetworkManager>,
}

impl NodeConfigController {
    pub fn new(
        config: NodeConfigControllerConfig,
        client: Client,
        manager: Arc<NetworkManager>,
    ) -> Self {
        Self {
            config,
            client,
            manager,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let worker = Arc::new(AsyncWorker::new(self.config.requeue_delay));

        let (clusters, writer) = reflector::store::<Cluster>();
        let stream = reflector::reflector(
            writer,
            watcher::watcher(Api::<Cluster>::all(self.client.clone()), watcher::Config::default()),
        );
        tokio::spawn({
            let worker = Arc::clone(&worker);
            drive_watch(stream, "Cluster", cancel.clone(), move |_| worker.add(SYNC_KEY))
        });

        let (cluster_nodes, writer) = reflector::store::<ClusterNode>();
        let stream = reflector::reflector(
            writer,
            watcher::watcher(
                Api::<ClusterNode>::all(self.client.clone()),
                watcher::Config::default(),
            ),
        );
        tokio::spawn({
            let worker = Arc::clone(&worker);
            drive_watch(stream, "ClusterNode", cancel.clone(), move |_| worker.add(SYNC_KEY))
        });

        let node_config_api = Api::<NodeConfig>::all(self.client.clone());
        let (node_configs, writer) = reflector::store::<NodeConfig>();
        let stream = reflector::reflector(
            writer,
            watcher::watcher(node_config_api.clone(), watcher::Config::default()),
        );
        tokio::spawn(drive_watch(stream, "NodeConfig", cancel.clone(), |_| {}));

        for ready in [
            clusters.wait_until_ready().await,
            cluster_nodes.wait_until_ready().await,
            node_configs.wait_until_ready().await,
        ] {
            ready.map_err(|e| Error::Internal(format!("reflector cache: {}", e)))?;
        }
        info!("NodeConfig controller caches synced");

        let reconciler = Arc::new(NodeConfigReconciler::new(
            self.manager,
            Arc::new(KubeSnapshot {
                clusters,
                cluster_nodes,
                node_configs,
            }),
            Arc::new(KubeNodeConfigWriter::new(node_config_api)),
        ));
        // One key, so one worker
        worker.run(1, reconciler, cancel).await;

        info!("NodeConfig controller stopped");
        Ok(())
    }
}
