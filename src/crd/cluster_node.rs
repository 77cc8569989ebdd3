//! ClusterNode CRD
//!
//! One node of a member cluster as seen by the overlay: its role, underlay
//! addresses and the pod CIDRs discovered by the CNI adapters.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// ClusterNode CRD
// =============================================================================

/// ClusterNode mirrors a member-cluster node inside the control-plane cluster.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kosmos.io",
    version = "v1alpha1",
    kind = "ClusterNode",
    plural = "clusternodes",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "IP", "type": "string", "jsonPath": ".spec.ip"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNodeSpec {
    /// Name of the Kubernetes node in the member cluster
    #[serde(default)]
    pub node_name: String,

    /// Name of the owning Cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Pod CIDRs currently allocated to the node
    #[serde(rename = "podCIDRs", default, skip_serializing_if = "Vec::is_empty")]
    pub pod_cidrs: Vec<String>,

    /// IPv4 underlay address
    #[serde(default)]
    pub ip: String,

    /// IPv6 underlay address
    #[serde(default)]
    pub ip6: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,

    /// Physical interface the tunnel devices bind to
    #[serde(default)]
    pub interface_name: String,

    /// Public address; both ends having one switches the link to IPSec
    #[serde(rename = "elasticip", default, skip_serializing_if = "String::is_empty")]
    pub elastic_ip: String,
}

/// Role of a node in the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Gateway,
    Endpoint,
    Internal,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Gateway => write!(f, "gateway"),
            Role::Endpoint => write!(f, "endpoint"),
            Role::Internal => write!(f, "internal"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl ClusterNode {
    pub fn is_gateway(&self) -> bool {
        self.spec.roles.contains(&Role::Gateway)
    }

    /// Name of the resource, empty for objects that were never persisted
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn has_elastic_ip(&self) -> bool {
        !self.spec.elastic_ip.is_empty()
    }
}

/// Canonical ClusterNode name for a Kubernetes node of a member cluster
pub fn cluster_node_name(cluster_name: &str, node_name: &str) -> String {
    format!("{}-{}", cluster_name, node_name)
}
