//! NodeConfig CRD
//!
//! The complete set of low-level network primitives one node needs to reach
//! every other cluster. It is recomputed and replaced as a whole on every
//! pipeline run; the per-node agent diffs it against the kernel state.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

// =============================================================================
// NodeConfig CRD
// =============================================================================

/// NodeConfig holds the computed network primitives of one node.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kosmos.io",
    version = "v1alpha1",
    kind = "NodeConfig",
    plural = "nodeconfigs",
    status = "NodeConfigStatus",
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
pub struct NodeConfigSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iptables: Vec<Iptables>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fdbs: Vec<Fdb>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arps: Vec<Arp>,

    #[serde(rename = "xfrmpolicies", default, skip_serializing_if = "Vec::is_empty")]
    pub xfrm_policies: Vec<XfrmPolicy>,

    #[serde(rename = "xfrmstates", default, skip_serializing_if = "Vec::is_empty")]
    pub xfrm_states: Vec<XfrmState>,

    #[serde(rename = "ipsetsavoidmasq", default, skip_serializing_if = "Vec::is_empty")]
    pub ipsets_avoid_masq: Vec<IpSet>,
}

// =============================================================================
// Primitives
// =============================================================================

/// Kind of network device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Vxlan,
}

/// Tunnel interface descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub name: String,
    /// Tunnel address with prefix length, e.g. `220.0.0.10/8`
    pub addr: String,
    pub mac: String,
    /// Physical device the tunnel is bound to
    pub bind_dev: String,
    /// VXLAN network identifier
    pub id: i32,
    /// VXLAN UDP port
    pub port: i32,
}

/// Static route: `ip route add <cidr> via <gw> dev <dev>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Route {
    pub cidr: String,
    pub gw: String,
    pub dev: String,
}

/// Single iptables rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Iptables {
    pub table: String,
    pub chain: String,
    pub rule: String,
}

/// Forwarding database entry: `bridge fdb append <mac> dev <dev> dst <ip>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Fdb {
    pub ip: String,
    pub mac: String,
    pub dev: String,
}

/// Static neighbour entry: `arp -s <ip> <mac> -i <dev>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Arp {
    pub ip: String,
    pub mac: String,
    pub dev: String,
}

/// IPSec tunnel-mode policy:
///
/// `ip xfrm policy add src $left_net dst $right_net dir $dir
///  tmpl src $left_ip dst $right_ip proto esp reqid $req_id mode tunnel`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct XfrmPolicy {
    #[serde(rename = "leftip")]
    pub left_ip: String,
    #[serde(rename = "leftnet")]
    pub left_net: String,
    #[serde(rename = "rightip")]
    pub right_ip: String,
    #[serde(rename = "rightnet")]
    pub right_net: String,
    #[serde(rename = "reqid")]
    pub req_id: i32,
    pub dir: i32,
}

/// IPSec state:
///
/// `ip xfrm state add src $left_ip dst $right_ip proto esp spi $spi reqid $req_id
///  mode tunnel aead 'rfc4106(gcm(aes))' $psk 128`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct XfrmState {
    #[serde(rename = "leftip")]
    pub left_ip: String,
    #[serde(rename = "rightip")]
    pub right_ip: String,
    #[serde(rename = "reqid")]
    pub req_id: i32,
    pub spi: u32,
    #[serde(rename = "PSK")]
    pub psk: String,
}

/// Member of a named IP set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IpSet {
    pub cidr: String,
    pub name: String,
}

/// Direction codes of xfrm policies, matching the kernel's XFRM_POLICY_* values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XfrmDirection {
    In = 0,
    Out = 1,
    Fwd = 2,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the NodeConfig
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigStatus {
    /// Last time the spec content changed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_change_time: Option<DateTime<Utc>>,

    /// Last time the node agent applied the spec
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Implementations
// =============================================================================

impl NodeConfigSpec {
    /// Sort every primitive list descending by its canonical JSON encoding,
    /// so unchanged input always yields byte-identical output.
    pub fn sort(&mut self) {
        sort_desc_by_json(&mut self.devices);
        sort_desc_by_json(&mut self.routes);
        sort_desc_by_json(&mut self.iptables);
        sort_desc_by_json(&mut self.fdbs);
        sort_desc_by_json(&mut self.arps);
        sort_desc_by_json(&mut self.xfrm_policies);
        sort_desc_by_json(&mut self.xfrm_states);
        sort_desc_by_json(&mut self.ipsets_avoid_masq);
    }

    /// Find a device by name
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.routes.is_empty()
            && self.iptables.is_empty()
            && self.fdbs.is_empty()
            && self.arps.is_empty()
            && self.xfrm_policies.is_empty()
            && self.xfrm_states.is_empty()
            && self.ipsets_avoid_masq.is_empty()
    }
}

fn sort_desc_by_json<T: Serialize>(items: &mut [T]) {
    items.sort_by_cached_key(|item| Reverse(serde_json::to_string(item).unwrap_or_default()));
}
