//! Address algebra for the HA VPN network.
//!
//! The VPN network is a single IPv6 /96 that is partitioned deterministically.
//! With the default `fd8f:6d53:b97a:1::/96` the carve-up is:
//!
//! - per-server underlying tunnel subnets (`fd8f:6d53:b97a:1::1:0/112` for
//!   VPN index 0, byte 14 holds the index),
//! - the /104 bonding subnet, inside which
//!   - shoot clients get `fd8f:6d53:b97a:1::b:<index>`,
//!   - seed clients draw from `fd8f:6d53:b97a:1::a:0` + 1..=0xffff via the
//!     IP broker.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use crate::constants::BOND_DEVICE;

pub const VPN_NETWORK_PREFIX: u8 = 96;
pub const BOND_PREFIX: u8 = 104;
pub const TUNNEL_PREFIX: u8 = 112;

const BOND_START_SEED: u8 = 0x0a;
const BOND_START_SHOOT: u8 = 0x0b;
const SEED_POOL_START: u16 = 1;
const SEED_POOL_END: u16 = 0xffff;

/// Bonding IP of shoot client `index` inside the VPN network.
pub fn bonding_shoot_client_ip(vpn_network: &Ipv6Net, index: u8) -> Ipv6Addr {
    let mut octets = vpn_network.network().octets();
    octets[13] = BOND_START_SHOOT;
    octets[15] = index;
    Ipv6Addr::from(octets)
}

/// Bonding address (IP + /104 bonding-subnet prefix) of shoot client `index`.
pub fn bonding_shoot_client_addr(vpn_network: &Ipv6Net, index: u8) -> Ipv6Net {
    bonding_address_for(bonding_shoot_client_ip(vpn_network, index))
}

/// Attaches the bonding-subnet prefix to an already assigned bonding IP.
pub fn bonding_address_for(ip: Ipv6Addr) -> Ipv6Net {
    Ipv6Net::new(ip, BOND_PREFIX).expect("bond prefix length is valid")
}

/// Bonding IPs of all shoot clients, in index order.
pub fn all_bonding_shoot_client_ips(vpn_network: &Ipv6Net, count: u8) -> Vec<Ipv6Addr> {
    (0..count)
        .map(|i| bonding_shoot_client_ip(vpn_network, i))
        .collect()
}

/// Pool of bonding IPs available to seed clients: `base` plus an index drawn
/// from `start..=end`, spread over the two low address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedClientRange {
    pub base: Ipv6Addr,
    pub start: u16,
    pub end: u16,
}

impl SeedClientRange {
    pub fn ip_for_index(&self, index: u16) -> Ipv6Addr {
        let mut octets = self.base.octets();
        octets[14] = (index >> 8) as u8;
        octets[15] = index as u8;
        Ipv6Addr::from(octets)
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }
}

/// The seed-side broker pool of the VPN network.
pub fn bonding_seed_client_range(vpn_network: &Ipv6Net) -> SeedClientRange {
    let mut octets = vpn_network.network().octets();
    octets[13] = BOND_START_SEED;
    SeedClientRange {
        base: Ipv6Addr::from(octets),
        start: SEED_POOL_START,
        end: SEED_POOL_END,
    }
}

/// Shoot client index encoded in a shoot bonding IP.
pub fn client_index_from_bonding_ip(ip: &Ipv6Addr) -> u8 {
    ip.octets()[15]
}

/// Name of the IP-in-IPv6 tunnel device toward `remote`, derived from the
/// low two bytes of the remote bonding address. The result is 15 octets,
/// the maximum Linux interface name length.
pub fn bond_tunnel_link_name(remote: &Ipv6Addr) -> String {
    let octets = remote.octets();
    format!("{BOND_DEVICE}ip6tnl{:02x}{:02x}", octets[14], octets[15])
}

/// Underlying /112 tunnel subnet of VPN server `index`.
pub fn ha_tunnel_network(vpn_network: &Ipv6Net, index: u8) -> Ipv6Net {
    let mut octets = vpn_network.network().octets();
    octets[13] = 1;
    octets[14] = index;
    Ipv6Net::new(Ipv6Addr::from(octets), TUNNEL_PREFIX).expect("tunnel prefix length is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpn() -> Ipv6Net {
        "fd8f:6d53:b97a:1::/96".parse().unwrap()
    }

    #[test]
    fn shoot_client_ips() {
        assert_eq!(
            bonding_shoot_client_ip(&vpn(), 0),
            "fd8f:6d53:b97a:1::b:0".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            bonding_shoot_client_ip(&vpn(), 1),
            "fd8f:6d53:b97a:1::b:1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            bonding_shoot_client_ip(&vpn(), 0xff),
            "fd8f:6d53:b97a:1::b:ff".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn shoot_client_addr_lives_in_bonding_subnet() {
        let addr = bonding_shoot_client_addr(&vpn(), 3);
        assert_eq!(addr.prefix_len(), BOND_PREFIX);
        assert!(vpn().contains(&addr.addr()));
    }

    #[test]
    fn client_index_round_trips() {
        for index in [0u8, 1, 7, 0xff] {
            let ip = bonding_shoot_client_ip(&vpn(), index);
            assert_eq!(client_index_from_bonding_ip(&ip), index);
        }
    }

    #[test]
    fn seed_range_boundaries() {
        let range = bonding_seed_client_range(&vpn());
        assert_eq!(range.len(), 0xffff);
        assert_eq!(
            range.ip_for_index(range.start),
            "fd8f:6d53:b97a:1::a:1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            range.ip_for_index(range.end),
            "fd8f:6d53:b97a:1::a:ffff".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn seed_range_is_disjoint_from_shoot_ips() {
        let range = bonding_seed_client_range(&vpn());
        let shoot: Vec<_> = all_bonding_shoot_client_ips(&vpn(), 0xff);
        for index in range.start..=range.end {
            assert!(!shoot.contains(&range.ip_for_index(index)));
        }
    }

    #[test]
    fn tunnel_link_name_fits_ifnamsiz() {
        let remote = bonding_shoot_client_ip(&vpn(), 0x47);
        let name = bond_tunnel_link_name(&remote);
        assert_eq!(name, "bond0ip6tnl0047");
        assert!(name.len() <= 15);

        let seed = bonding_seed_client_range(&vpn()).ip_for_index(0xa47);
        assert_eq!(bond_tunnel_link_name(&seed), "bond0ip6tnl0a47");
    }

    #[test]
    fn tunnel_networks_per_index() {
        assert_eq!(
            ha_tunnel_network(&vpn(), 0),
            "fd8f:6d53:b97a:1::1:0/112".parse::<Ipv6Net>().unwrap()
        );
        assert_eq!(
            ha_tunnel_network(&vpn(), 1),
            "fd8f:6d53:b97a:1::1:100/112".parse::<Ipv6Net>().unwrap()
        );
    }
}
