//! Names and numbers shared by the pipeline and the node agents

/// IPv4 inter-cluster tunnel device
pub const VXLAN_BRIDGE_NAME: &str = "vx-bridge";
/// IPv4 intra-cluster (gateway hop) tunnel device
pub const VXLAN_LOCAL_NAME: &str = "vx-local";
pub const VXLAN_BRIDGE_NAME_6: &str = "vx-bridge-6";
pub const VXLAN_LOCAL_NAME_6: &str = "vx-local-6";

pub const VXLAN_BRIDGE_ID: i32 = 54;
pub const VXLAN_BRIDGE_PORT: i32 = 4876;
pub const VXLAN_LOCAL_ID: i32 = 55;
pub const VXLAN_LOCAL_PORT: i32 = 4877;
pub const VXLAN_BRIDGE_ID_6: i32 = 64;
pub const VXLAN_BRIDGE_PORT_6: i32 = 4866;
pub const VXLAN_LOCAL_ID_6: i32 = 65;
pub const VXLAN_LOCAL_PORT_6: i32 = 4867;

/// Default FDB destination; VXLAN needs it before ARP has resolved anything
pub const ALL_ZERO_MAC: &str = "00:00:00:00:00:00";

pub const NAT_TABLE: &str = "nat";
pub const CLUSTERLINK_PREROUTING_CHAIN: &str = "CLUSTERLINK-PREROUTING";
pub const CLUSTERLINK_POSTROUTING_CHAIN: &str = "CLUSTERLINK-POSTROUTING";

/// IP set exempted from the default SNAT of masquerading CNIs
pub const IPSET_AVOID_MASQ: &str = "kosmos-ipset-avoid-masq";

/// CNIs that masquerade all pod egress
pub const MASQUERADE_CNIS: &[&str] = &["flannel", "tencent-globalrouter"];

/// reqid shared by every xfrm policy/state the pipeline emits
pub const DEFAULT_REQ_ID: i32 = 14;
