//! Pod and service routes.
//!
//! Each target advertises a set of CIDRs; every node of every other cluster
//! learns how to reach them. Gateway nodes and p2p nodes tunnel straight to
//! the target's bridge device, internal nodes of gateway-mode clusters hop
//! through their own gateway's local device. When both ends own an elastic
//! IP the direct route is replaced by IPSec material.

use super::{device_from_results, node_config, Context, Results};
use crate::crd::{Cluster, ClusterNode, Route, XfrmDirection, XfrmPolicy, XfrmState};
use crate::error::Result;
use crate::network::constants::DEFAULT_REQ_ID;
use crate::network::filter::Filter;
use crate::network::ip::{
    addr_ip, convert_to_global_cidrs, filter_by_ip_family, intersect, IpFamily,
};
use tracing::{debug, warn};

pub(super) fn run_pod_routes(ctx: &mut Context) -> Result<()> {
    let Context {
        filter,
        results,
        psk_seed,
    } = ctx;

    for target in filter.endpoint_nodes() {
        let Some(cluster) = filter.cluster_of(target) else {
            continue;
        };
        let cidrs = advertised_pod_cidrs(cluster, target)?;
        build_routes(filter, results, psk_seed, target, &cidrs)?;
    }
    Ok(())
}

pub(super) fn run_service_routes(ctx: &mut Context) -> Result<()> {
    let Context {
        filter,
        results,
        psk_seed,
    } = ctx;

    for target in filter.gateway_nodes() {
        let Some(cluster) = filter.cluster_of(target) else {
            continue;
        };
        let cidrs = advertised(cluster, cluster.service_cidrs())?;
        build_routes(filter, results, psk_seed, target, &cidrs)?;
    }
    Ok(())
}

/// Pod CIDRs a node stands for: its own in a p2p cluster, otherwise the
/// cluster aggregate.
fn advertised_pod_cidrs(cluster: &Cluster, node: &ClusterNode) -> Result<Vec<String>> {
    if cluster.is_p2p() {
        advertised(cluster, &node.spec.pod_cidrs)
    } else {
        advertised(cluster, cluster.pod_cidrs())
    }
}

fn advertised(cluster: &Cluster, cidrs: &[String]) -> Result<Vec<String>> {
    let cidrs = filter_by_ip_family(cidrs, cluster.ip_family())?;
    Ok(match cluster.link_options() {
        Some(opts) => convert_to_global_cidrs(&cidrs, &opts.global_cidrs_map),
        None => cidrs,
    })
}

/// Whether `cidr` overlaps the cluster's own pod or service network
fn conflicts_with_cluster(cluster: &Cluster, cidr: &str) -> Result<bool> {
    for own in cluster.pod_cidrs().iter().chain(cluster.service_cidrs()) {
        if intersect(own, cidr)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Install routes towards `target` for `cidrs` on every node outside the
/// target's cluster.
fn build_routes(
    filter: &Filter,
    results: &mut Results,
    psk_seed: &str,
    target: &ClusterNode,
    cidrs: &[String],
) -> Result<()> {
    let others = filter.nodes_except_cluster(&target.spec.cluster_name);

    for cidr in cidrs {
        let family = IpFamily::of_cidr(cidr)?;
        let bridge = family.bridge_device();
        let local = family.local_device();

        let target_ip = match device_from_results(results, target.name(), bridge) {
            Some(dev) => addr_ip(&dev.addr)?,
            None => {
                warn!(node = %target.name(), device = bridge, "Target tunnel device not found");
                continue;
            }
        };

        for node in &others {
            let Some(src_cluster) = filter.cluster_of(node) else {
                continue;
            };
            if !family.is_supported_by(src_cluster.ip_family()) {
                continue;
            }
            if conflicts_with_cluster(src_cluster, cidr)? {
                debug!(
                    node = %node.name(),
                    cidr = %cidr,
                    "Skipping route that overlaps the cluster's own network"
                );
                continue;
            }

            if node.is_gateway() || src_cluster.is_p2p() {
                if target.has_elastic_ip() && node.has_elastic_ip() {
                    let node_cidrs = advertised_pod_cidrs(src_cluster, node)?;
                    add_ipsec_rules(results, psk_seed, target, node, &node_cidrs, cidr)?;
                } else {
                    node_config(results, node.name())?.routes.push(Route {
                        cidr: cidr.clone(),
                        gw: target_ip.to_string(),
                        dev: bridge.to_string(),
                    });
                }
                continue;
            }

            let Some(gw) = filter.gateway_node_by_cluster(&node.spec.cluster_name) else {
                warn!(cluster = %node.spec.cluster_name, "Gateway node not found");
                continue;
            };
            let gw_ip = match device_from_results(results, gw.name(), local) {
                Some(dev) => addr_ip(&dev.addr)?,
                None => {
                    warn!(node = %gw.name(), device = local, "Gateway tunnel device not found");
                    continue;
                }
            };

            node_config(results, node.name())?.routes.push(Route {
                cidr: cidr.clone(),
                gw: gw_ip.to_string(),
                dev: local.to_string(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// IPSec
// =============================================================================

/// SPI shared by both ends of a link, independent of which side computes it
pub(crate) fn link_spi(a: &str, b: &str) -> u32 {
    let (first, second) = if a > b { (a, b) } else { (b, a) };
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    hasher.finalize()
}

/// Hex key material: md5 of the seed followed by the SPI
pub(crate) fn link_psk(seed: &str, spi: u32) -> String {
    let digest = md5::compute(seed.as_bytes());
    let mut bytes = digest.0.to_vec();
    bytes.extend_from_slice(&spi.to_be_bytes());
    hex::encode(bytes)
}

fn add_ipsec_rules(
    results: &mut Results,
    psk_seed: &str,
    target: &ClusterNode,
    node: &ClusterNode,
    node_cidrs: &[String],
    cidr: &str,
) -> Result<()> {
    let spi = link_spi(node.name(), target.name());
    let psk = link_psk(psk_seed, spi);
    let local_ip = &node.spec.ip;
    let remote_ip = &target.spec.elastic_ip;

    let config = node_config(results, node.name())?;
    config.xfrm_states.push(XfrmState {
        left_ip: local_ip.clone(),
        right_ip: remote_ip.clone(),
        req_id: DEFAULT_REQ_ID,
        spi,
        psk: psk.clone(),
    });
    config.xfrm_states.push(XfrmState {
        left_ip: remote_ip.clone(),
        right_ip: local_ip.clone(),
        req_id: DEFAULT_REQ_ID,
        spi,
        psk,
    });

    for node_cidr in node_cidrs {
        config.xfrm_policies.push(XfrmPolicy {
            left_ip: local_ip.clone(),
            left_net: node_cidr.clone(),
            right_ip: remote_ip.clone(),
            right_net: cidr.to_string(),
            req_id: DEFAULT_REQ_ID,
            dir: XfrmDirection::Out as i32,
        });
        for dir in [XfrmDirection::In, XfrmDirection::Fwd] {
            config.xfrm_policies.push(XfrmPolicy {
                left_ip: remote_ip.clone(),
                left_net: cidr.to_string(),
                right_ip: local_ip.clone(),
                right_net: node_cidr.clone(),
                req_id: DEFAULT_REQ_ID,
                dir: dir as i32,
            });
        }
    }
    Ok(())
}
