//! Bonding link manager.
//!
//! Builds the HA aggregate once at pod startup: N tap devices (one per VPN
//! server) enslaved to `bond0`, the bonding address on the aggregate, and on
//! the seed side one pre-created IP-in-IPv6 tunnel per shoot peer. Tap and
//! bond devices survive pod restarts, so everything is delete-if-exists
//! before create. A failure leaves the caller with no usable aggregate and
//! must be treated as fatal.

use ipnet::Ipv6Net;

use crate::config::ClientConfig;
use crate::constants::BOND_DEVICE;
use crate::network::address::{bonding_shoot_client_ip, bond_tunnel_link_name};
use crate::network::netlink::{BondMode, NetlinkHandle};
use crate::network::NetworkResult;

pub fn tap_name(index: u8) -> String {
    format!("tap{index}")
}

/// Creates taps, aggregate and bonding address; on the seed side also the
/// outbound tunnel devices toward all shoot peers.
pub async fn configure(
    netlink: &NetlinkHandle,
    cfg: &ClientConfig,
    own_address: Ipv6Net,
) -> NetworkResult<()> {
    for index in 0..cfg.ha_vpn_servers {
        let name = tap_name(index);
        netlink.delete_link(&name).await?;
        netlink.create_tap(&name).await?;
    }

    netlink.delete_link(BOND_DEVICE).await?;
    netlink.create_bond(BOND_DEVICE, cfg.bonding_mode).await?;
    let bond_index = netlink.link_index(BOND_DEVICE).await?;

    for index in 0..cfg.ha_vpn_servers {
        let tap_index = netlink.link_index(&tap_name(index)).await?;
        netlink.set_link_master(tap_index, bond_index).await?;
        netlink.set_link_up(tap_index).await?;
    }
    if cfg.bonding_mode == BondMode::ActiveBackup {
        // tap0 is primary to avoid ambiguity when several slaves are up.
        netlink.set_bond_primary(BOND_DEVICE, &tap_name(0)).await?;
    }

    netlink.set_link_up(bond_index).await?;
    netlink.add_address_nodad(BOND_DEVICE, own_address).await?;
    tracing::info!(address = %own_address, mode = %cfg.bonding_mode.as_str(), "bonding aggregate configured");

    if !cfg.is_shoot_client {
        // The shoot side creates its tunnel halves dynamically when peers
        // advertise; the seed side knows all shoot peers up front.
        for index in 0..cfg.ha_vpn_clients {
            let remote = bonding_shoot_client_ip(&cfg.vpn_network, index);
            let name = bond_tunnel_link_name(&remote);
            netlink.delete_link(&name).await?;
            netlink
                .create_ip6_tunnel(&name, own_address.addr(), remote)
                .await?;
            tracing::info!(link = %name, %remote, "created shoot peer tunnel");
        }
    }

    Ok(())
}
