//! Cluster CRD
//!
//! A member ("leaf") cluster joined into the overlay, together with the
//! network options that decide how the pipeline wires it to the others.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Cluster CRD
// =============================================================================

/// Cluster describes a member cluster and its overlay network options.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kosmos.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    printcolumn = r#"{"name": "Network Type", "type": "string", "jsonPath": ".spec.clusterLinkOptions.networkType"}"#,
    printcolumn = r#"{"name": "IP Family", "type": "string", "jsonPath": ".spec.clusterLinkOptions.ipFamily"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Namespace the overlay agents run in on the member cluster
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Overlay network options; clusters without them are ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_link_options: Option<ClusterLinkOptions>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Overlay network options of a cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterLinkOptions {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// CNI plugin running in the member cluster
    #[serde(default = "default_cni")]
    pub cni: String,

    #[serde(default)]
    pub network_type: NetworkType,

    #[serde(default)]
    pub ip_family: IpFamilyType,

    /// Address pool of the intra-cluster (gateway hop) tunnel devices
    #[serde(rename = "localCIDRs", default = "default_local_cidrs")]
    pub local_cidrs: VxlanCidrs,

    /// Address pool of the inter-cluster tunnel devices
    #[serde(rename = "bridgeCIDRs", default = "default_bridge_cidrs")]
    pub bridge_cidrs: VxlanCidrs,

    /// Literal CIDR substitutions applied before the cluster's CIDRs are advertised
    #[serde(rename = "globalCIDRsMap", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global_cidrs_map: BTreeMap<String, String>,

    #[serde(rename = "defaultNICName", default = "default_nic_name")]
    pub default_nic_name: String,
}

impl Default for ClusterLinkOptions {
    fn default() -> Self {
        Self {
            enable: true,
            cni: default_cni(),
            network_type: NetworkType::default(),
            ip_family: IpFamilyType::default(),
            local_cidrs: default_local_cidrs(),
            bridge_cidrs: default_bridge_cidrs(),
            global_cidrs_map: BTreeMap::new(),
            default_nic_name: default_nic_name(),
        }
    }
}

/// Topology mode of a cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Every node tunnels directly to every other cluster
    #[default]
    P2P,
    /// Only gateway nodes tunnel out; the rest hop through them
    Gateway,
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkType::P2P => write!(f, "p2p"),
            NetworkType::Gateway => write!(f, "gateway"),
        }
    }
}

/// IP families a cluster takes part in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum IpFamilyType {
    #[default]
    All,
    Ipv4,
    Ipv6,
}

impl IpFamilyType {
    pub fn supports_ipv4(&self) -> bool {
        matches!(self, IpFamilyType::All | IpFamilyType::Ipv4)
    }

    pub fn supports_ipv6(&self) -> bool {
        matches!(self, IpFamilyType::All | IpFamilyType::Ipv6)
    }
}

impl std::fmt::Display for IpFamilyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamilyType::All => write!(f, "all"),
            IpFamilyType::Ipv4 => write!(f, "ipv4"),
            IpFamilyType::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Per-family CIDR pair for tunnel address pools
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VxlanCidrs {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ip6: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub cluster_link_status: ClusterLinkStatus,
}

/// Network facts reported for the whole cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ClusterLinkStatus {
    #[serde(rename = "podCIDRs", default, skip_serializing_if = "Vec::is_empty")]
    pub pod_cidrs: Vec<String>,
    #[serde(rename = "serviceCIDRs", default, skip_serializing_if = "Vec::is_empty")]
    pub service_cidrs: Vec<String>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "kosmos-system".to_string()
}

fn default_cni() -> String {
    "calico".to_string()
}

fn default_nic_name() -> String {
    "*".to_string()
}

fn default_local_cidrs() -> VxlanCidrs {
    VxlanCidrs {
        ip: "210.0.0.0/8".to_string(),
        ip6: "9480::/16".to_string(),
    }
}

fn default_bridge_cidrs() -> VxlanCidrs {
    VxlanCidrs {
        ip: "220.0.0.0/8".to_string(),
        ip6: "9470::/16".to_string(),
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Cluster {
    /// Network options, if the cluster takes part in the overlay
    pub fn link_options(&self) -> Option<&ClusterLinkOptions> {
        self.spec.cluster_link_options.as_ref()
    }

    pub fn is_p2p(&self) -> bool {
        self.link_options()
            .map(|o| o.network_type == NetworkType::P2P)
            .unwrap_or(false)
    }

    pub fn is_gateway(&self) -> bool {
        self.link_options()
            .map(|o| o.network_type == NetworkType::Gateway)
            .unwrap_or(false)
    }

    pub fn ip_family(&self) -> IpFamilyType {
        self.link_options().map(|o| o.ip_family).unwrap_or_default()
    }

    /// CNI name, empty when the cluster has no network options
    pub fn cni(&self) -> &str {
        self.link_options().map(|o| o.cni.as_str()).unwrap_or("")
    }

    /// Aggregate pod CIDRs reported for the cluster
    pub fn pod_cidrs(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.cluster_link_status.pod_cidrs.as_slice())
            .unwrap_or(&[])
    }

    /// Aggregate service CIDRs reported for the cluster
    pub fn service_cidrs(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.cluster_link_status.service_cidrs.as_slice())
            .unwrap_or(&[])
    }
}
