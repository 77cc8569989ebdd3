//! Network Manager
//!
//! Validates a snapshot, runs the handler pipeline over it and keeps the
//! sorted output of the last successful run.

use crate::crd::{Cluster, ClusterNode, NodeConfig, NodeConfigSpec};
use crate::error::Result;
use crate::metrics::metrics;
use crate::network::filter::{exclude_invalid_items, Filter};
use crate::network::handlers::{run_pipeline, Context, Results};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Manager configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Seed of the IPSec pre-shared keys
    #[serde(default)]
    pub psk_seed: String,
}

// =============================================================================
// Manager
// =============================================================================

/// Computes and holds the per-node network configs
#[derive(Debug, Default)]
pub struct NetworkManager {
    config: ManagerConfig,
    node_configs: RwLock<Results>,
}

impl NetworkManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            node_configs: RwLock::new(Results::new()),
        }
    }

    /// Run the pipeline over a snapshot.
    ///
    /// `previous` are the NodeConfigs published so far; their device MACs are
    /// kept stable. On failure the configs of the last successful run stay in
    /// place.
    pub fn calculate_network_configs(
        &self,
        clusters: Vec<Cluster>,
        cluster_nodes: Vec<ClusterNode>,
        previous: Vec<NodeConfig>,
    ) -> Result<Results> {
        let started = Instant::now();
        let (clusters, cluster_nodes) = exclude_invalid_items(clusters, cluster_nodes);
        debug!(
            clusters = clusters.len(),
            nodes = cluster_nodes.len(),
            "Calculating network configs"
        );

        let filter = Filter::new(clusters, cluster_nodes, previous);
        let mut ctx = Context::new(filter, self.config.psk_seed.clone());
        let outcome = run_pipeline(&mut ctx);
        metrics()
            .pipeline_duration
            .observe(started.elapsed().as_secs_f64());

        if let Err(e) = outcome {
            warn!(error = %e, "Network pipeline failed, keeping previous configs");
            metrics().pipeline_runs.with_label_values(&["failure"]).inc();
            return Err(e);
        }

        let mut results = ctx.results;
        results.values_mut().for_each(NodeConfigSpec::sort);

        info!(nodes = results.len(), "Calculated network configs");
        metrics().pipeline_runs.with_label_values(&["success"]).inc();
        metrics().node_configs.set(results.len() as i64);

        *self.node_configs.write() = results.clone();
        Ok(results)
    }

    /// Configs of the last successful run
    pub fn get_configs(&self) -> Results {
        self.node_configs.read().clone()
    }

    pub fn get_configs_by_node_name(&self, node_name: &str) -> Option<NodeConfigSpec> {
        self.node_configs.read().get(node_name).cloned()
    }

    /// JSON dump of all configs, keyed by node
    pub fn configs_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.node_configs.read())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::*;
    use crate::network::constants::*;
    use crate::network::filter::tests::{cluster, node};

    /// Cluster A (p2p, 10.1.0.0/16) and cluster B (gateway mode,
    /// 10.2.0.0/16) with gateway GB and internal node IB
    fn scenario() -> (Vec<Cluster>, Vec<ClusterNode>) {
        let mut a1 = node("a", "n1", "192.168.1.1", false);
        a1.spec.pod_cidrs = vec!["10.1.0.0/16".into()];
        (
            vec![
                cluster("a", NetworkType::P2P, &["10.1.0.0/16"]),
                cluster("b", NetworkType::Gateway, &["10.2.0.0/16"]),
            ],
            vec![
                a1,
                node("b", "gb", "192.168.2.1", true),
                node("b", "ib", "192.168.2.2", false),
            ],
        )
    }

    fn manager() -> NetworkManager {
        NetworkManager::new(ManagerConfig {
            psk_seed: "seed".into(),
        })
    }

    #[test]
    fn test_scenario() {
        let (clusters, nodes) = scenario();
        let results = manager()
            .calculate_network_configs(clusters, nodes, vec![])
            .unwrap();

        let gb = &results["b-gb"];
        assert!(gb.routes.contains(&Route {
            cidr: "10.1.0.0/16".into(),
            gw: "220.168.1.1".into(),
            dev: VXLAN_BRIDGE_NAME.into(),
        }));

        let ib = &results["b-ib"];
        let to_a: Vec<_> = ib.routes.iter().filter(|r| r.cidr == "10.1.0.0/16").collect();
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].dev, VXLAN_LOCAL_NAME);
        assert_eq!(to_a[0].gw, "210.168.2.1");

        let gb_local = gb.device(VXLAN_LOCAL_NAME).unwrap();
        assert!(ib.arps.iter().any(|a| a.ip == "210.168.2.1" && a.mac == gb_local.mac));
        assert!(ib.fdbs.iter().any(|f| f.ip == "192.168.2.1" && f.mac == gb_local.mac));
        assert!(ib.fdbs.iter().any(|f| f.ip == "192.168.2.1" && f.mac == ALL_ZERO_MAC));
    }

    #[test]
    fn test_deterministic_output() {
        let (clusters, nodes) = scenario();
        let first = manager()
            .calculate_network_configs(clusters.clone(), nodes.clone(), vec![])
            .unwrap();

        let (mut clusters2, mut nodes2) = (clusters, nodes);
        clusters2.reverse();
        nodes2.reverse();
        let second = manager()
            .calculate_network_configs(clusters2, nodes2, vec![])
            .unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_invalid_nodes_are_excluded() {
        let (clusters, mut nodes) = scenario();
        let mut broken = node("a", "n2", "192.168.1.2", false);
        broken.spec.interface_name.clear();
        nodes.push(broken);

        let results = manager()
            .calculate_network_configs(clusters, nodes, vec![])
            .unwrap();
        assert!(!results.contains_key("a-n2"));
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_failed_run_keeps_previous_results() {
        let manager = manager();
        let (clusters, nodes) = scenario();
        manager
            .calculate_network_configs(clusters.clone(), nodes.clone(), vec![])
            .unwrap();
        let before = manager.configs_json().unwrap();

        let mut bad_nodes = nodes;
        bad_nodes[0].spec.pod_cidrs = vec!["10.1.0.0/99".into()];
        assert!(manager
            .calculate_network_configs(clusters, bad_nodes, vec![])
            .is_err());
        assert_eq!(manager.configs_json().unwrap(), before);
    }

    #[test]
    fn test_get_configs_by_node_name() {
        let manager = manager();
        assert!(manager.get_configs().is_empty());

        let (clusters, nodes) = scenario();
        manager
            .calculate_network_configs(clusters, nodes, vec![])
            .unwrap();
        assert!(manager.get_configs_by_node_name("b-gb").is_some());
        assert!(manager.get_configs_by_node_name("missing").is_none());
        assert_eq!(manager.get_configs().len(), 3);
    }

    #[test]
    fn test_flannel_cluster_ipsets() {
        let (mut clusters, mut nodes) = scenario();
        let mut flannel = cluster("f", NetworkType::P2P, &["10.9.0.0/16"]);
        if let Some(opts) = flannel.spec.cluster_link_options.as_mut() {
            opts.cni = "flannel".into();
        }
        clusters.push(flannel);
        nodes.push(node("f", "n1", "192.168.9.1", false));

        let results = manager()
            .calculate_network_configs(clusters, nodes, vec![])
            .unwrap();
        let cidrs: Vec<_> = results["f-n1"]
            .ipsets_avoid_masq
            .iter()
            .map(|s| s.cidr.as_str())
            .collect();
        assert!(cidrs.contains(&"10.1.0.0/16"));
        assert!(cidrs.contains(&"10.2.0.0/16"));
        assert!(!cidrs.contains(&"10.9.0.0/16"));
    }
}
