//! Masquerade exemption for CNIs that SNAT all pod egress.
//!
//! Every node of such a cluster gets the advertised pod CIDRs of all other
//! clusters in one IP set, which the node agent hooks into its NAT rules.

use super::{node_config, Context};
use crate::crd::IpSet;
use crate::error::Result;
use crate::network::constants::{IPSET_AVOID_MASQ, MASQUERADE_CNIS};
use crate::network::ip::{convert_to_global_cidrs, filter_by_ip_family};
use kube::ResourceExt;
use tracing::debug;

pub(super) fn run(ctx: &mut Context) -> Result<()> {
    let Context { filter, results, .. } = ctx;
    let (masquerading, _) = filter.partition_clusters_by_cni(MASQUERADE_CNIS);

    for cluster in masquerading {
        let name = cluster.name_any();

        let mut entries = Vec::new();
        for other in filter.clusters() {
            if other.name_any() == name {
                continue;
            }
            let cidrs = filter_by_ip_family(other.pod_cidrs(), other.ip_family())?;
            let cidrs = match other.link_options() {
                Some(opts) => convert_to_global_cidrs(&cidrs, &opts.global_cidrs_map),
                None => cidrs,
            };
            entries.extend(cidrs.into_iter().map(|cidr| IpSet {
                cidr,
                name: IPSET_AVOID_MASQ.to_string(),
            }));
        }

        debug!(cluster = %name, entries = entries.len(), "Adding masquerade exemptions");
        for node in filter.nodes_by_cluster(&name) {
            node_config(results, node.name())?
                .ipsets_avoid_masq
                .extend(entries.iter().cloned());
        }
    }
    Ok(())
}
