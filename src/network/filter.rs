//! Snapshot Filter
//!
//! Read-only query layer over one point-in-time snapshot of Clusters,
//! ClusterNodes and the previously published NodeConfigs. Every handler of
//! the pipeline reads the topology exclusively through this type.

use crate::crd::{Cluster, ClusterNode, Device, IpFamilyType, NodeConfig};
use crate::network::ip::IpFamily;
use kube::ResourceExt;
use std::collections::HashMap;
use tracing::{debug, warn};

// =============================================================================
// Validation
// =============================================================================

/// Drop everything the pipeline cannot reason about.
///
/// Clusters without (or with disabled) network options go first. A node is
/// then dropped when its cluster or interface name is empty, when its owning
/// cluster is unknown after the first pass, or when it lacks the underlay
/// address the cluster's IP family requires.
pub fn exclude_invalid_items(
    clusters: Vec<Cluster>,
    cluster_nodes: Vec<ClusterNode>,
) -> (Vec<Cluster>, Vec<ClusterNode>) {
    let clusters: Vec<Cluster> = clusters
        .into_iter()
        .filter(|cluster| match cluster.link_options() {
            Some(opts) if opts.enable => true,
            _ => {
                debug!(cluster = %cluster.name_any(), "Excluding cluster without link options");
                false
            }
        })
        .collect();

    let families: HashMap<&str, IpFamilyType> = clusters
        .iter()
        .filter_map(|c| c.metadata.name.as_deref().map(|n| (n, c.ip_family())))
        .collect();

    let cluster_nodes = cluster_nodes
        .into_iter()
        .filter(|node| {
            let spec = &node.spec;
            if spec.cluster_name.is_empty() || spec.interface_name.is_empty() {
                warn!(
                    node = %node.name(),
                    "Excluding cluster node with empty clusterName or interfaceName"
                );
                return false;
            }

            let Some(family) = families.get(spec.cluster_name.as_str()) else {
                warn!(
                    node = %node.name(),
                    cluster = %spec.cluster_name,
                    "Excluding cluster node of unknown or unconfigured cluster"
                );
                return false;
            };

            let has_address = match family {
                IpFamilyType::Ipv4 => !spec.ip.is_empty(),
                IpFamilyType::Ipv6 => !spec.ip6.is_empty(),
                IpFamilyType::All => !spec.ip.is_empty() || !spec.ip6.is_empty(),
            };
            if !has_address {
                warn!(
                    node = %node.name(),
                    family = %family,
                    "Excluding cluster node without an address of the cluster's IP family"
                );
            }
            has_address
        })
        .collect();

    (clusters, cluster_nodes)
}

// =============================================================================
// Filter
// =============================================================================

/// Query layer over a validated snapshot
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clusters: Vec<Cluster>,
    cluster_nodes: Vec<ClusterNode>,
    node_configs: Vec<NodeConfig>,
    cluster_index: HashMap<String, usize>,
}

impl Filter {
    /// Build a filter over already validated items.
    ///
    /// Clusters and nodes are ordered by name so that the pipeline output
    /// does not depend on the order the lister returned them in.
    pub fn new(
        mut clusters: Vec<Cluster>,
        mut cluster_nodes: Vec<ClusterNode>,
        node_configs: Vec<NodeConfig>,
    ) -> Self {
        clusters.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        cluster_nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let cluster_index = clusters
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.metadata.name.clone().map(|n| (n, i)))
            .collect();

        Self {
            clusters,
            cluster_nodes,
            node_configs,
            cluster_index,
        }
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn cluster_nodes(&self) -> &[ClusterNode] {
        &self.cluster_nodes
    }

    pub fn cluster_by_name(&self, name: &str) -> Option<&Cluster> {
        self.cluster_index.get(name).map(|&i| &self.clusters[i])
    }

    /// Owning cluster of a node
    pub fn cluster_of(&self, node: &ClusterNode) -> Option<&Cluster> {
        self.cluster_by_name(&node.spec.cluster_name)
    }

    pub fn nodes_by_cluster(&self, cluster_name: &str) -> Vec<&ClusterNode> {
        self.cluster_nodes
            .iter()
            .filter(|n| n.spec.cluster_name == cluster_name)
            .collect()
    }

    /// Every node of every other cluster
    pub fn nodes_except_cluster(&self, cluster_name: &str) -> Vec<&ClusterNode> {
        self.cluster_nodes
            .iter()
            .filter(|n| n.spec.cluster_name != cluster_name)
            .collect()
    }

    /// Nodes holding the gateway role
    pub fn gateway_nodes(&self) -> Vec<&ClusterNode> {
        self.cluster_nodes.iter().filter(|n| n.is_gateway()).collect()
    }

    /// First gateway node of a cluster
    pub fn gateway_node_by_cluster(&self, cluster_name: &str) -> Option<&ClusterNode> {
        self.cluster_nodes
            .iter()
            .find(|n| n.spec.cluster_name == cluster_name && n.is_gateway())
    }

    /// Nodes that terminate inter-cluster tunnels: gateway nodes plus every
    /// node of a p2p cluster. Each node appears once.
    pub fn endpoint_nodes(&self) -> Vec<&ClusterNode> {
        self.cluster_nodes
            .iter()
            .filter(|n| n.is_gateway() || self.cluster_of(n).map(|c| c.is_p2p()).unwrap_or(false))
            .collect()
    }

    /// Non-gateway nodes of gateway-mode clusters
    pub fn internal_nodes(&self) -> Vec<&ClusterNode> {
        self.cluster_nodes
            .iter()
            .filter(|n| {
                !n.is_gateway() && self.cluster_of(n).map(|c| c.is_gateway()).unwrap_or(false)
            })
            .collect()
    }

    pub fn internal_nodes_by_cluster(&self, cluster_name: &str) -> Vec<&ClusterNode> {
        self.internal_nodes()
            .into_iter()
            .filter(|n| n.spec.cluster_name == cluster_name)
            .collect()
    }

    /// All nodes of gateway-mode clusters
    pub fn gateway_cluster_nodes(&self) -> Vec<&ClusterNode> {
        self.cluster_nodes
            .iter()
            .filter(|n| self.cluster_of(n).map(|c| c.is_gateway()).unwrap_or(false))
            .collect()
    }

    pub fn supports_ipv4(&self, node: &ClusterNode) -> bool {
        self.cluster_of(node)
            .map(|c| c.ip_family().supports_ipv4())
            .unwrap_or(false)
    }

    pub fn supports_ipv6(&self, node: &ClusterNode) -> bool {
        self.cluster_of(node)
            .map(|c| c.ip_family().supports_ipv6())
            .unwrap_or(false)
    }

    /// Families a node's cluster takes part in
    pub fn families(&self, node: &ClusterNode) -> Vec<IpFamily> {
        self.cluster_of(node)
            .map(|c| IpFamily::supported_by(c.ip_family()))
            .unwrap_or_default()
    }

    /// Split clusters by whether their CNI is one of `cnis`
    pub fn partition_clusters_by_cni(&self, cnis: &[&str]) -> (Vec<&Cluster>, Vec<&Cluster>) {
        self.clusters.iter().partition(|c| cnis.contains(&c.cni()))
    }

    /// Device of the NodeConfig published before this run
    pub fn device_from_previous_config(
        &self,
        node_name: &str,
        device_name: &str,
    ) -> Option<&Device> {
        self.node_configs
            .iter()
            .find(|c| c.metadata.name.as_deref() == Some(node_name))
            .and_then(|c| c.spec.device(device_name))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::*;

    pub(crate) fn cluster(name: &str, network_type: NetworkType, pod_cidrs: &[&str]) -> Cluster {
        let mut cluster = Cluster::new(
            name,
            ClusterSpec {
                namespace: "kosmos-system".into(),
                cluster_link_options: Some(ClusterLinkOptions {
                    network_type,
                    ip_family: IpFamilyType::Ipv4,
                    ..Default::default()
                }),
            },
        );
        cluster.status = Some(ClusterStatus {
            cluster_link_status: ClusterLinkStatus {
                pod_cidrs: pod_cidrs.iter().map(|s| s.to_string()).collect(),
                service_cidrs: vec![],
            },
        });
        cluster
    }

    pub(crate) fn node(cluster: &str, name: &str, ip: &str, gateway: bool) -> ClusterNode {
        ClusterNode::new(
            &cluster_node_name(cluster, name),
            ClusterNodeSpec {
                node_name: name.into(),
                cluster_name: cluster.into(),
                ip: ip.into(),
                interface_name: "eth0".into(),
                roles: if gateway { vec![Role::Gateway] } else { vec![] },
                ..Default::default()
            },
        )
    }

    fn names(nodes: Vec<&ClusterNode>) -> Vec<&str> {
        nodes.into_iter().map(|n| n.name()).collect()
    }

    fn sample() -> Filter {
        let clusters = vec![
            cluster("a", NetworkType::P2P, &["10.1.0.0/16"]),
            cluster("b", NetworkType::Gateway, &["10.2.0.0/16"]),
        ];
        let nodes = vec![
            node("b", "ib", "192.168.2.2", false),
            node("a", "n1", "192.168.1.1", false),
            node("b", "gb", "192.168.2.1", true),
            node("a", "n2", "192.168.1.2", false),
        ];
        Filter::new(clusters, nodes, vec![])
    }

    #[test]
    fn test_exclude_invalid_items() {
        let mut no_options = cluster("c", NetworkType::P2P, &[]);
        no_options.spec.cluster_link_options = None;
        let clusters = vec![cluster("a", NetworkType::P2P, &[]), no_options];

        let mut no_iface = node("a", "n2", "192.168.1.2", false);
        no_iface.spec.interface_name.clear();
        let mut no_cluster = node("a", "n3", "192.168.1.3", false);
        no_cluster.spec.cluster_name.clear();
        let nodes = vec![
            node("a", "n1", "192.168.1.1", false),
            no_iface,
            no_cluster,
            node("c", "n4", "192.168.3.1", false),
            node("missing", "n5", "192.168.4.1", false),
            node("a", "n6", "", false),
        ];

        let (clusters, nodes) = exclude_invalid_items(clusters, nodes);
        assert_eq!(clusters.len(), 1);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name(), "a-n1");
    }

    #[test]
    fn test_exclude_disabled_cluster() {
        let mut disabled = cluster("a", NetworkType::P2P, &[]);
        if let Some(opts) = disabled.spec.cluster_link_options.as_mut() {
            opts.enable = false;
        }
        let (clusters, nodes) =
            exclude_invalid_items(vec![disabled], vec![node("a", "n1", "192.168.1.1", false)]);
        assert!(clusters.is_empty());
        assert!(nodes.is_empty());
    }

    #[test]
    fn test_role_classification() {
        let filter = sample();
        assert_eq!(names(filter.gateway_nodes()), vec!["b-gb"]);
        assert_eq!(names(filter.endpoint_nodes()), vec!["a-n1", "a-n2", "b-gb"]);
        assert_eq!(names(filter.internal_nodes()), vec!["b-ib"]);
        assert_eq!(names(filter.internal_nodes_by_cluster("a")), Vec::<&str>::new());
        assert_eq!(names(filter.gateway_cluster_nodes()), vec!["b-gb", "b-ib"]);
        assert_eq!(filter.gateway_node_by_cluster("b").map(|n| n.name()), Some("b-gb"));
        assert!(filter.gateway_node_by_cluster("a").is_none());
    }

    #[test]
    fn test_cluster_queries() {
        let filter = sample();
        assert!(filter.cluster_by_name("a").is_some());
        assert!(filter.cluster_by_name("z").is_none());
        assert_eq!(names(filter.nodes_by_cluster("a")), vec!["a-n1", "a-n2"]);
        assert_eq!(names(filter.nodes_except_cluster("a")), vec!["b-gb", "b-ib"]);
    }

    #[test]
    fn test_family_support() {
        let filter = sample();
        let n1 = filter.nodes_by_cluster("a")[0].clone();
        assert!(filter.supports_ipv4(&n1));
        assert!(!filter.supports_ipv6(&n1));
        assert_eq!(filter.families(&n1), vec![IpFamily::V4]);
    }

    #[test]
    fn test_partition_by_cni() {
        let mut flannel = cluster("f", NetworkType::P2P, &[]);
        if let Some(opts) = flannel.spec.cluster_link_options.as_mut() {
            opts.cni = "flannel".into();
        }
        let filter = Filter::new(
            vec![cluster("a", NetworkType::P2P, &[]), flannel],
            vec![],
            vec![],
        );
        let (masq, rest) = filter.partition_clusters_by_cni(&["flannel"]);
        assert_eq!(masq.len(), 1);
        assert_eq!(rest.len(), 1);
        assert_eq!(masq[0].metadata.name.as_deref(), Some("f"));
    }

    #[test]
    fn test_device_from_previous_config() {
        let config = NodeConfig::new(
            "a-n1",
            NodeConfigSpec {
                devices: vec![Device {
                    name: "vx-bridge".into(),
                    mac: "02:00:00:00:00:01".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let filter = Filter::new(vec![], vec![], vec![config]);
        let dev = filter.device_from_previous_config("a-n1", "vx-bridge");
        assert_eq!(dev.map(|d| d.mac.as_str()), Some("02:00:00:00:00:01"));
        assert!(filter.device_from_previous_config("a-n1", "vx-local").is_none());
        assert!(filter.device_from_previous_config("a-n2", "vx-bridge").is_none());
    }
}
