//! Tunnel devices.
//!
//! Every node of a gateway-mode cluster gets a local device for the hop to
//! its gateway; every endpoint node gets a bridge device towards the other
//! clusters. One device per supported family whose address pool and node
//! underlay address are both set.

use super::{node_config, Context};
use crate::crd::{ClusterLinkOptions, ClusterNode, Device, DeviceType};
use crate::error::Result;
use crate::network::constants::*;
use crate::network::filter::Filter;
use crate::network::ip::{derive_mac, generate_vxlan_ip, IpFamily};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tunnel {
    Local,
    Bridge,
}

impl Tunnel {
    fn device_name(&self, family: IpFamily) -> &'static str {
        match self {
            Tunnel::Local => family.local_device(),
            Tunnel::Bridge => family.bridge_device(),
        }
    }

    /// VNI and UDP port
    fn params(&self, family: IpFamily) -> (i32, i32) {
        match (self, family) {
            (Tunnel::Local, IpFamily::V4) => (VXLAN_LOCAL_ID, VXLAN_LOCAL_PORT),
            (Tunnel::Local, IpFamily::V6) => (VXLAN_LOCAL_ID_6, VXLAN_LOCAL_PORT_6),
            (Tunnel::Bridge, IpFamily::V4) => (VXLAN_BRIDGE_ID, VXLAN_BRIDGE_PORT),
            (Tunnel::Bridge, IpFamily::V6) => (VXLAN_BRIDGE_ID_6, VXLAN_BRIDGE_PORT_6),
        }
    }

    fn pool<'a>(&self, opts: &'a ClusterLinkOptions, family: IpFamily) -> &'a str {
        match self {
            Tunnel::Local => family.pool(&opts.local_cidrs),
            Tunnel::Bridge => family.pool(&opts.bridge_cidrs),
        }
    }
}

pub(super) fn run_local(ctx: &mut Context) -> Result<()> {
    let Context { filter, results, .. } = ctx;
    for node in filter.gateway_cluster_nodes() {
        for device in build_devices(filter, node, Tunnel::Local)? {
            node_config(results, node.name())?.devices.push(device);
        }
    }
    Ok(())
}

pub(super) fn run_bridge(ctx: &mut Context) -> Result<()> {
    let Context { filter, results, .. } = ctx;
    for node in filter.endpoint_nodes() {
        for device in build_devices(filter, node, Tunnel::Bridge)? {
            node_config(results, node.name())?.devices.push(device);
        }
    }
    Ok(())
}

fn build_devices(filter: &Filter, node: &ClusterNode, tunnel: Tunnel) -> Result<Vec<Device>> {
    let Some(opts) = filter.cluster_of(node).and_then(|c| c.link_options()) else {
        return Ok(Vec::new());
    };

    let mut devices = Vec::with_capacity(2);
    for family in filter.families(node) {
        let underlay_ip = family.underlay_ip(node);
        let pool = tunnel.pool(opts, family);
        if underlay_ip.is_empty() || pool.is_empty() {
            debug!(node = %node.name(), family = %family, "No address for tunnel device");
            continue;
        }

        let name = tunnel.device_name(family);
        let (id, port) = tunnel.params(family);
        let mac = filter
            .device_from_previous_config(node.name(), name)
            .map(|d| d.mac.clone())
            .filter(|mac| !mac.is_empty())
            .unwrap_or_else(|| derive_mac(node.name(), name));

        devices.push(Device {
            device_type: DeviceType::Vxlan,
            name: name.to_string(),
            addr: generate_vxlan_ip(underlay_ip, pool)?,
            mac,
            bind_dev: node.spec.interface_name.clone(),
            id,
            port,
        });
    }
    Ok(devices)
}
