//! Static FDB/ARP entries for tunnel peers.
//!
//! VXLAN point-to-point tunnels have no flood and learn domain, so every
//! node needs its peers' MACs pre-populated: internal nodes and their
//! gateway on the local device, endpoint nodes pairwise on the bridge device.

use super::{device_from_results, node_config, Context, Results};
use crate::crd::{Arp, ClusterNode, Fdb};
use crate::error::Result;
use crate::network::constants::ALL_ZERO_MAC;
use crate::network::ip::{addr_ip, IpFamily};
use tracing::warn;

/// Entries on `src` that resolve `peer`'s tunnel device of `device_name`.
/// `None` when the peer has no such device.
fn peer_entries(
    results: &Results,
    family: IpFamily,
    device_name: &str,
    peer: &ClusterNode,
) -> Result<Option<(Vec<Fdb>, Arp)>> {
    let Some(dev) = device_from_results(results, peer.name(), device_name) else {
        warn!(node = %peer.name(), device = device_name, "Peer tunnel device not found");
        return Ok(None);
    };
    let underlay_ip = family.underlay_ip(peer).to_string();

    let fdbs = vec![
        // Default destination, used before ARP resolves
        Fdb {
            ip: underlay_ip.clone(),
            mac: ALL_ZERO_MAC.to_string(),
            dev: device_name.to_string(),
        },
        Fdb {
            ip: underlay_ip,
            mac: dev.mac.clone(),
            dev: device_name.to_string(),
        },
    ];
    let arp = Arp {
        ip: addr_ip(&dev.addr)?.to_string(),
        mac: dev.mac.clone(),
        dev: device_name.to_string(),
    };
    Ok(Some((fdbs, arp)))
}

fn push_entries(
    results: &mut Results,
    node_name: &str,
    entries: Vec<(Vec<Fdb>, Arp)>,
) -> Result<()> {
    let config = node_config(results, node_name)?;
    for (fdbs, arp) in entries {
        config.fdbs.extend(fdbs);
        config.arps.push(arp);
    }
    Ok(())
}

pub(super) fn run_local(ctx: &mut Context) -> Result<()> {
    let Context { filter, results, .. } = ctx;

    // internal => gateway
    for node in filter.internal_nodes() {
        let Some(gw) = filter.gateway_node_by_cluster(&node.spec.cluster_name) else {
            warn!(cluster = %node.spec.cluster_name, "Gateway node not found");
            continue;
        };
        let mut entries = Vec::new();
        for family in filter.families(node) {
            if let Some(entry) = peer_entries(results, family, family.local_device(), gw)? {
                entries.push(entry);
            }
        }
        push_entries(results, node.name(), entries)?;
    }

    // gateway => internal, for host-network traffic
    for gw in filter.gateway_nodes() {
        let mut entries = Vec::new();
        for family in filter.families(gw) {
            for node in filter.internal_nodes_by_cluster(&gw.spec.cluster_name) {
                if let Some(entry) = peer_entries(results, family, family.local_device(), node)? {
                    entries.push(entry);
                }
            }
        }
        push_entries(results, gw.name(), entries)?;
    }
    Ok(())
}

pub(super) fn run_bridge(ctx: &mut Context) -> Result<()> {
    let Context { filter, results, .. } = ctx;
    let nodes = filter.endpoint_nodes();

    for src in &nodes {
        let src_families = filter.families(src);
        let mut entries = Vec::new();
        for tar in &nodes {
            if src.name() == tar.name() {
                continue;
            }
            for family in filter.families(tar) {
                if !src_families.contains(&family) {
                    continue;
                }
                if let Some(entry) = peer_entries(results, family, family.bridge_device(), tar)? {
                    entries.push(entry);
                }
            }
        }
        push_entries(results, src.name(), entries)?;
    }
    Ok(())
}
