//! Planner for the double-NAT netmap.
//!
//! Shoot networks may overlap seed networks, so the kube-apiserver's
//! effective destinations are remapped 1:1 onto disjoint sub-prefixes of a
//! reserved range inside 240.0.0.0/4. The plan computed here drives both the
//! NETMAP iptables rules and the routes installed by the path controller.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::constants::{
    SHOOT_NODE_NETWORK_MAPPED, SHOOT_POD_NETWORK_MAPPED, SHOOT_SERVICE_NETWORK_MAPPED,
};
use crate::network::cidr::{by_family, Cidr, IpFamily};

#[derive(Debug, Error)]
pub enum NetmapError {
    #[error("not enough space in {dst} to fit all source subnets")]
    NoSpace { dst: Ipv4Net },
    #[error("invalid prefix length for mapped subnet")]
    Prefix(#[from] ipnet::PrefixLenError),
}

/// One `src -> dst` mapping of the plan. `dst` has the same prefix length as
/// `src` and is a sub-prefix of the reservation range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetmapEntry {
    pub src: Ipv4Net,
    pub dst: Ipv4Net,
}

/// Maps `ip` into `subnet`, keeping the host bits not covered by the subnet
/// mask.
pub fn netmap_ip(ip: Ipv4Addr, subnet: Ipv4Net) -> Ipv4Addr {
    let mask = u32::from(subnet.netmask());
    let base = u32::from(subnet.network());
    Ipv4Addr::from((u32::from(ip) & !mask) | base)
}

/// Maps the source prefixes onto disjoint sub-prefixes of `dst`.
///
/// Sources are processed largest-first (ascending prefix length). A free
/// list of destination sub-prefixes starts as `{dst}`; for each source the
/// free list is split into candidates of the source's prefix length, the
/// first candidate becomes that source's destination and the remaining
/// candidates form the new free list. Identical input yields an identical
/// plan.
pub fn plan_netmap(srcs: &[Ipv4Net], dst: Ipv4Net) -> Result<Vec<NetmapEntry>, NetmapError> {
    let mut sorted = srcs.to_vec();
    sorted.sort_by_key(|net| net.prefix_len());

    let mut free = vec![dst];
    let mut plan = Vec::with_capacity(sorted.len());

    for src in sorted {
        let mut candidates = Vec::new();
        for parent in &free {
            let subnets = parent
                .subnets(src.prefix_len())
                .map_err(|_| NetmapError::NoSpace { dst })?;
            candidates.extend(subnets);
        }
        let Some(target) = candidates.first().copied() else {
            return Err(NetmapError::NoSpace { dst });
        };
        let mapped = Ipv4Net::new(netmap_ip(src.network(), target), src.prefix_len())?;
        plan.push(NetmapEntry { src, dst: mapped });
        free = candidates.split_off(1);
    }

    Ok(plan)
}

/// The netmap plans for the three shoot network classes, each confined to
/// its reserved destination range. Only IPv4 networks are mapped; IPv6
/// networks are routed unmapped.
#[derive(Debug, Clone, Default)]
pub struct ShootNetmapPlans {
    pub pod: Vec<NetmapEntry>,
    pub service: Vec<NetmapEntry>,
    pub node: Vec<NetmapEntry>,
}

impl ShootNetmapPlans {
    /// Looks up the mapped destination for a source network, if any plan
    /// carries it.
    pub fn mapped(&self, src: Ipv4Net) -> Option<Ipv4Net> {
        self.pod
            .iter()
            .chain(&self.service)
            .chain(&self.node)
            .find(|entry| entry.src == src)
            .map(|entry| entry.dst)
    }
}

fn mapped_range(range: &str) -> Ipv4Net {
    range.parse().expect("reserved mapping range is a valid CIDR")
}

/// Plans the mappings of the shoot pod, service and node networks into their
/// reserved ranges.
pub fn shoot_networks_for_netmap(
    pod_networks: &[Cidr],
    service_networks: &[Cidr],
    node_networks: &[Cidr],
) -> Result<ShootNetmapPlans, NetmapError> {
    let v4 = |cidrs: &[Cidr]| -> Vec<Ipv4Net> {
        by_family(cidrs, IpFamily::Ipv4)
            .iter()
            .filter_map(Cidr::as_ipv4)
            .collect()
    };

    Ok(ShootNetmapPlans {
        pod: plan_netmap(&v4(pod_networks), mapped_range(SHOOT_POD_NETWORK_MAPPED))?,
        service: plan_netmap(&v4(service_networks), mapped_range(SHOOT_SERVICE_NETWORK_MAPPED))?,
        node: plan_netmap(&v4(node_networks), mapped_range(SHOOT_NODE_NETWORK_MAPPED))?,
    })
}
