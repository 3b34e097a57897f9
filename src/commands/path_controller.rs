//! Seed-side path controller entry point.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::Ipv4Net;

use crate::config::PathControllerConfig;
use crate::constants::SEED_POD_NETWORK_MAPPED;
use crate::network::address::all_bonding_shoot_client_ips;
use crate::network::cidr::{overlaps_any, Cidr};
use crate::network::netlink::NetlinkHandle;
use crate::network::netmap::netmap_ip;
use crate::pathctl::{IcmpPinger, NetlinkRouter, PathController, PING_RETRIES, PING_TIMEOUT};

use super::CommandError;

pub async fn run(cfg: PathControllerConfig) -> Result<(), CommandError> {
    let shoot_networks: Vec<Cidr> = cfg
        .shoot_pod_networks
        .iter()
        .chain(&cfg.shoot_service_networks)
        .chain(&cfg.shoot_node_networks)
        .copied()
        .collect();
    let overlap = overlaps_any(&cfg.seed_pod_network, &shoot_networks);

    // When seed and shoot space collide, the advertised pod IP must be the
    // NETMAP'd one; that is the address the shoot side can actually reach.
    let pod_ip = match (cfg.pod_ip, overlap) {
        (IpAddr::V4(v4), true) => {
            let mapped_range: Ipv4Net = SEED_POD_NETWORK_MAPPED
                .parse()
                .expect("reserved mapping range is a valid CIDR");
            IpAddr::V4(netmap_ip(v4, mapped_range))
        }
        (ip, _) => ip,
    };

    let netlink = Arc::new(NetlinkHandle::new()?);
    let router = Arc::new(NetlinkRouter {
        netlink,
        seed_pod_network: cfg.seed_pod_network,
        shoot_pod_networks: cfg.shoot_pod_networks.clone(),
        shoot_service_networks: cfg.shoot_service_networks.clone(),
        shoot_node_networks: cfg.shoot_node_networks.clone(),
    });
    let pinger = IcmpPinger::new(PING_TIMEOUT, PING_RETRIES);
    let mut controller = PathController::new(pinger as _, router as _, pod_ip.to_string());

    let clients = all_bonding_shoot_client_ips(&cfg.vpn_network, cfg.ha_vpn_clients);
    tracing::info!(clients = clients.len(), advertised_ip = %pod_ip, "starting path controller");

    tokio::select! {
        _ = controller.run(clients) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("path controller shutting down"),
    }
    Ok(())
}
