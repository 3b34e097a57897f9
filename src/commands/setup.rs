//! Client setup: kernel settings, firewall rules and the bonding aggregate.
//!
//! Runs once as an init step of the client pods. A failure here is fatal;
//! there is no point starting OpenVPN on a half-built aggregate.

use std::sync::Arc;

use crate::bonding;
use crate::config::ClientConfig;
use crate::ippool::{IpAddressBroker, PodAnnotationStore};
use crate::network::address::{bonding_address_for, bonding_shoot_client_addr};
use crate::network::firewall;
use crate::network::netlink::NetlinkHandle;
use crate::openvpn::values::build_client_values;

use super::CommandError;

pub async fn run(cfg: ClientConfig) -> Result<(), CommandError> {
    kernel_settings(&cfg)?;
    firewall::set_client_rules(&cfg).await?;

    if cfg.is_ha {
        let netlink = NetlinkHandle::new()?;
        let own_address = if cfg.is_shoot_client {
            let index = cfg
                .vpn_client_index
                .ok_or("POD_NAME carries no client index")?;
            bonding_shoot_client_addr(&cfg.vpn_network, index)
        } else {
            let store =
                PodAnnotationStore::new(&cfg.namespace, &cfg.pod_label_selector).await?;
            let mut broker = IpAddressBroker::new(
                Arc::new(store),
                &cfg.vpn_network,
                &cfg.pod_name,
                cfg.wait_time,
            )?;
            tracing::info!("acquiring bonding ip through the pod annotations");
            bonding_address_for(broker.acquire().await?)
        };
        bonding::configure(&netlink, &cfg, own_address).await?;
    }

    let values = build_client_values(&cfg)?;
    tracing::info!(values = %serde_json::to_string(&values)?, "client values assembled");
    Ok(())
}

fn kernel_settings(cfg: &ClientConfig) -> std::io::Result<()> {
    if cfg.is_shoot_client {
        sysctl_write("net/ipv4/ip_forward", "1")?;
        sysctl_write("net/ipv6/conf/all/forwarding", "1")?;
        return Ok(());
    }
    ensure_ipv6_enabled()
}

/// Some host OSes disable IPv6 in pods; the bonding network needs it.
fn ensure_ipv6_enabled() -> std::io::Result<()> {
    let current = std::fs::read_to_string("/proc/sys/net/ipv6/conf/all/disable_ipv6")?;
    if current.trim() == "1" {
        tracing::info!("IPv6 networking is disabled in the pod, enabling it");
        sysctl_write("net/ipv6/conf/all/disable_ipv6", "0")?;
    }
    Ok(())
}

fn sysctl_write(key: &str, value: &str) -> std::io::Result<()> {
    std::fs::write(format!("/proc/sys/{key}"), value)
}
