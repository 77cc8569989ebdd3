//! SNAT on gateway nodes so that host-network traffic of internal nodes,
//! which arrives from the local tunnel pool, leaves the hub with the
//! gateway's bridge address as source.

use super::{device_from_results, node_config, Context};
use crate::crd::Iptables;
use crate::error::Result;
use crate::network::constants::{CLUSTERLINK_POSTROUTING_CHAIN, NAT_TABLE};
use crate::network::ip::addr_ip;

pub(super) fn run(ctx: &mut Context) -> Result<()> {
    let Context { filter, results, .. } = ctx;

    for gw in filter.gateway_nodes() {
        let Some(cluster) = filter.cluster_of(gw).filter(|c| c.is_gateway()) else {
            continue;
        };
        let Some(opts) = cluster.link_options() else {
            continue;
        };

        let mut rules = Vec::new();
        for family in filter.families(gw) {
            let local_pool = family.pool(&opts.local_cidrs);
            let bridge = family.bridge_device();
            let has_local =
                device_from_results(results, gw.name(), family.local_device()).is_some();
            if local_pool.is_empty() || !has_local {
                continue;
            }
            let Some(bridge_dev) = device_from_results(results, gw.name(), bridge) else {
                continue;
            };

            rules.push(Iptables {
                table: NAT_TABLE.to_string(),
                chain: CLUSTERLINK_POSTROUTING_CHAIN.to_string(),
                rule: format!(
                    "-s {} -o {} -j SNAT --to-source {}",
                    local_pool,
                    bridge,
                    addr_ip(&bridge_dev.addr)?
                ),
            });
        }
        node_config(results, gw.name())?.iptables.extend(rules);
    }
    Ok(())
}
