//! Address helpers: family detection, CIDR overlap, tunnel address derivation

use crate::crd::{ClusterNode, IpFamilyType, VxlanCidrs};
use crate::error::{Error, Result};
use crate::network::constants::*;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// =============================================================================
// IP Family
// =============================================================================

/// Address family of a concrete address or CIDR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Families a cluster's `ipFamily` setting allows, in a fixed order
    pub fn supported_by(family: IpFamilyType) -> Vec<IpFamily> {
        let mut families = Vec::with_capacity(2);
        if family.supports_ipv4() {
            families.push(IpFamily::V4);
        }
        if family.supports_ipv6() {
            families.push(IpFamily::V6);
        }
        families
    }

    pub fn is_supported_by(&self, family: IpFamilyType) -> bool {
        match self {
            IpFamily::V4 => family.supports_ipv4(),
            IpFamily::V6 => family.supports_ipv6(),
        }
    }

    /// Family of a CIDR such as `10.0.0.0/8`
    pub fn of_cidr(cidr: &str) -> Result<IpFamily> {
        let net: IpNet = cidr
            .parse()
            .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;
        Ok(Self::of_net(&net))
    }

    fn of_net(net: &IpNet) -> IpFamily {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }

    pub fn bridge_device(&self) -> &'static str {
        match self {
            IpFamily::V4 => VXLAN_BRIDGE_NAME,
            IpFamily::V6 => VXLAN_BRIDGE_NAME_6,
        }
    }

    pub fn local_device(&self) -> &'static str {
        match self {
            IpFamily::V4 => VXLAN_LOCAL_NAME,
            IpFamily::V6 => VXLAN_LOCAL_NAME_6,
        }
    }

    /// Underlay address of a node in this family
    pub fn underlay_ip<'a>(&self, node: &'a ClusterNode) -> &'a str {
        match self {
            IpFamily::V4 => &node.spec.ip,
            IpFamily::V6 => &node.spec.ip6,
        }
    }

    /// Tunnel address pool of this family
    pub fn pool<'a>(&self, cidrs: &'a VxlanCidrs) -> &'a str {
        match self {
            IpFamily::V4 => &cidrs.ip,
            IpFamily::V6 => &cidrs.ip6,
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

// =============================================================================
// CIDR Helpers
// =============================================================================

/// Whether two CIDRs share any address. Different families never overlap.
pub fn intersect(a: &str, b: &str) -> Result<bool> {
    let a: IpNet = a.parse().map_err(|_| Error::InvalidCidr(a.to_string()))?;
    let b: IpNet = b.parse().map_err(|_| Error::InvalidCidr(b.to_string()))?;
    Ok(a.contains(&b.network()) || b.contains(&a.network()))
}

/// Drop CIDRs outside the cluster's family; `all` keeps everything.
pub fn filter_by_ip_family(cidrs: &[String], family: IpFamilyType) -> Result<Vec<String>> {
    if family == IpFamilyType::All {
        return Ok(cidrs.to_vec());
    }
    let mut results = Vec::with_capacity(cidrs.len());
    for cidr in cidrs {
        if IpFamily::of_cidr(cidr)?.is_supported_by(family) {
            results.push(cidr.clone());
        }
    }
    Ok(results)
}

/// Replace CIDRs that have an entry in a cluster's global map
pub fn convert_to_global_cidrs(
    cidrs: &[String],
    global_map: &BTreeMap<String, String>,
) -> Vec<String> {
    cidrs
        .iter()
        .map(|cidr| global_map.get(cidr).unwrap_or(cidr).clone())
        .collect()
}

/// Address part of a `addr/len` tunnel address
pub fn addr_ip(addr: &str) -> Result<IpAddr> {
    let net: IpNet = addr
        .parse()
        .map_err(|_| Error::InvalidCidr(addr.to_string()))?;
    Ok(net.addr())
}

/// Place the host bits of `underlay_ip` inside `pool`, keeping the pool's
/// prefix length: `192.168.3.7` in `220.0.0.0/8` gives `220.168.3.7/8`.
pub fn generate_vxlan_ip(underlay_ip: &str, pool: &str) -> Result<String> {
    let ip: IpAddr = underlay_ip
        .parse()
        .map_err(|_| Error::InvalidIp(underlay_ip.to_string()))?;
    let net: IpNet = pool.parse().map_err(|_| Error::InvalidCidr(pool.to_string()))?;

    match (ip, net) {
        (IpAddr::V4(ip), IpNet::V4(net)) => {
            let mask = u32::from(net.netmask());
            let bits = (u32::from(net.network()) & mask) | (u32::from(ip) & !mask);
            let addr = Ipv4Net::new(Ipv4Addr::from(bits), net.prefix_len())
                .map_err(|_| Error::InvalidCidr(pool.to_string()))?;
            Ok(addr.to_string())
        }
        (IpAddr::V6(ip), IpNet::V6(net)) => {
            let mask = u128::from(net.netmask());
            let bits = (u128::from(net.network()) & mask) | (u128::from(ip) & !mask);
            let addr = Ipv6Net::new(Ipv6Addr::from(bits), net.prefix_len())
                .map_err(|_| Error::InvalidCidr(pool.to_string()))?;
            Ok(addr.to_string())
        }
        _ => Err(Error::IpFamilyMismatch {
            ip: underlay_ip.to_string(),
            cidr: pool.to_string(),
        }),
    }
}

/// Stable, locally administered unicast MAC for a node's device.
pub fn derive_mac(node_name: &str, device_name: &str) -> String {
    let digest = md5::compute(format!("{}/{}", node_name, device_name));
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&digest.0[..6]);
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_of_cidr() {
        assert_eq!(IpFamily::of_cidr("10.0.0.0/8").unwrap(), IpFamily::V4);
        assert_eq!(IpFamily::of_cidr("fd00::/64").unwrap(), IpFamily::V6);
        assert!(IpFamily::of_cidr("10.0.0.0").is_err());
        assert!(IpFamily::of_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn test_intersect() {
        assert!(intersect("10.0.0.0/8", "10.1.0.0/16").unwrap());
        assert!(intersect("10.1.0.0/16", "10.0.0.0/8").unwrap());
        assert!(!intersect("10.1.0.0/16", "10.2.0.0/16").unwrap());
        assert!(!intersect("10.0.0.0/8", "fd00::/64").unwrap());
        assert!(intersect("10.0.0.0/8", "garbage").is_err());
    }

    #[test]
    fn test_filter_by_ip_family() {
        let cidrs = vec!["10.0.0.0/16".to_string(), "fd00::/64".to_string()];
        assert_eq!(filter_by_ip_family(&cidrs, IpFamilyType::All).unwrap().len(), 2);
        assert_eq!(
            filter_by_ip_family(&cidrs, IpFamilyType::Ipv4).unwrap(),
            vec!["10.0.0.0/16".to_string()]
        );
        assert_eq!(
            filter_by_ip_family(&cidrs, IpFamilyType::Ipv6).unwrap(),
            vec!["fd00::/64".to_string()]
        );
    }

    #[test]
    fn test_convert_to_global_cidrs() {
        let map = BTreeMap::from([("10.0.0.0/8".to_string(), "172.16.0.0/12".to_string())]);
        let cidrs = vec!["10.0.0.0/8".to_string(), "10.9.0.0/16".to_string()];
        assert_eq!(
            convert_to_global_cidrs(&cidrs, &map),
            vec!["172.16.0.0/12".to_string(), "10.9.0.0/16".to_string()]
        );
        assert_eq!(convert_to_global_cidrs(&cidrs, &BTreeMap::new()), cidrs);
    }

    #[test]
    fn test_generate_vxlan_ip_v4() {
        assert_eq!(
            generate_vxlan_ip("192.168.3.7", "220.0.0.0/8").unwrap(),
            "220.168.3.7/8"
        );
        assert_eq!(
            generate_vxlan_ip("192.168.3.7", "210.10.0.0/16").unwrap(),
            "210.10.3.7/16"
        );
    }

    #[test]
    fn test_generate_vxlan_ip_v6() {
        assert_eq!(
            generate_vxlan_ip("fd00:1::5", "9470::/16").unwrap(),
            "9470:1::5/16"
        );
    }

    #[test]
    fn test_generate_vxlan_ip_errors() {
        assert!(matches!(
            generate_vxlan_ip("192.168.3.7", "9470::/16"),
            Err(Error::IpFamilyMismatch { .. })
        ));
        assert!(matches!(
            generate_vxlan_ip("192.168.3", "220.0.0.0/8"),
            Err(Error::InvalidIp(_))
        ));
    }

    #[test]
    fn test_addr_ip() {
        assert_eq!(addr_ip("220.168.3.7/8").unwrap().to_string(), "220.168.3.7");
        assert!(addr_ip("220.168.3.7").is_err());
    }

    #[test]
    fn test_derive_mac() {
        let mac = derive_mac("member1-node1", VXLAN_BRIDGE_NAME);
        assert_eq!(mac, derive_mac("member1-node1", VXLAN_BRIDGE_NAME));
        assert_ne!(mac, derive_mac("member1-node2", VXLAN_BRIDGE_NAME));
        assert_eq!(mac.len(), 17);

        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0);
    }
}
