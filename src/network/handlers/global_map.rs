//! NETMAP rules translating a cluster's real CIDRs to the global ones it
//! advertises, applied on the nodes that terminate inter-cluster tunnels.

use super::{device_from_results, node_config, Context};
use crate::crd::Iptables;
use crate::error::Result;
use crate::network::constants::{
    CLUSTERLINK_POSTROUTING_CHAIN, CLUSTERLINK_PREROUTING_CHAIN, NAT_TABLE,
};
use crate::network::ip::IpFamily;

pub(super) fn run(ctx: &mut Context) -> Result<()> {
    let Context { filter, results, .. } = ctx;

    for node in filter.endpoint_nodes() {
        let Some(opts) = filter.cluster_of(node).and_then(|c| c.link_options()) else {
            continue;
        };
        if opts.global_cidrs_map.is_empty() {
            continue;
        }

        let mut rules = Vec::new();
        // BTreeMap iteration keeps the rules ordered by source CIDR
        for (real, global) in &opts.global_cidrs_map {
            let bridge = IpFamily::of_cidr(real)?.bridge_device();
            if device_from_results(results, node.name(), bridge).is_none() {
                continue;
            }
            rules.push(Iptables {
                table: NAT_TABLE.to_string(),
                chain: CLUSTERLINK_PREROUTING_CHAIN.to_string(),
                rule: format!("-d {} -i {} -j NETMAP --to {}", global, bridge, real),
            });
            rules.push(Iptables {
                table: NAT_TABLE.to_string(),
                chain: CLUSTERLINK_POSTROUTING_CHAIN.to_string(),
                rule: format!("-s {} -o {} -j NETMAP --to {}", real, bridge, global),
            });
        }
        node_config(results, node.name())?.iptables.extend(rules);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NetworkType;
    use crate::network::filter::tests::{cluster, node};
    use crate::network::filter::Filter;
    use crate::network::handlers::{init_nodes, vx_network};

    #[test]
    fn test_netmap_rules() {
        let mut a = cluster("a", NetworkType::P2P, &["10.0.0.0/8"]);
        if let Some(opts) = a.spec.cluster_link_options.as_mut() {
            opts.global_cidrs_map
                .insert("10.0.0.0/8".into(), "172.16.0.0/12".into());
        }
        let filter = Filter::new(
            vec![a, cluster("c", NetworkType::P2P, &[])],
            vec![
                node("a", "n1", "192.168.1.1", false),
                node("c", "n1", "192.168.3.1", false),
            ],
            vec![],
        );
        let mut ctx = Context::new(filter, "seed");
        init_nodes::run(&mut ctx).unwrap();
        vx_network::run_bridge(&mut ctx).unwrap();
        run(&mut ctx).unwrap();

        let rules: Vec<_> = ctx.results["a-n1"]
            .iptables
            .iter()
            .map(|r| (r.chain.as_str(), r.rule.as_str()))
            .collect();
        assert_eq!(
            rules,
            vec![
                ("CLUSTERLINK-PREROUTING", "-d 172.16.0.0/12 -i vx-bridge -j NETMAP --to 10.0.0.0/8"),
                ("CLUSTERLINK-POSTROUTING", "-s 10.0.0.0/8 -o vx-bridge -j NETMAP --to 172.16.0.0/12"),
            ]
        );
        assert!(ctx.results["c-n1"].iptables.is_empty());
    }
}
