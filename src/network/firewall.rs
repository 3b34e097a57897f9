//! Firewall rule composition for both VPN endpoints.
//!
//! Three rule families live here:
//! - the double-NAT NETMAP rules derived from the netmap plan (seed and
//!   shoot side),
//! - the shoot-side forwarding/masquerading rules,
//! - the INPUT-chain lockdown installed and removed by the OpenVPN up/down
//!   hooks.
//!
//! All installs go through append-unique and all removals through
//! delete-if-exists, so repeated hook invocations stay idempotent.

use thiserror::Error;

use crate::config::ClientConfig;
use crate::constants::{
    BOND_DEVICE, ENVOY_NON_ROOT_USER_ID, ENVOY_VPN_GROUP_ID, SEED_POD_NETWORK_MAPPED,
    TUNNEL_DEVICE,
};
use crate::network::cidr::{overlaps_any, Cidr, IpFamily};
use crate::network::error::NetworkError;
use crate::network::iptables::Iptables;
use crate::network::netmap::{shoot_networks_for_netmap, NetmapEntry, NetmapError};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("netmap planning failed: {0}")]
    Netmap(#[from] NetmapError),
}

/// The INPUT-chain specs shared by the up/down hook: established traffic is
/// accepted, everything else arriving on the VPN device is dropped.
pub fn input_chain_specs(device: &str) -> Vec<Vec<String>> {
    vec![
        vec![
            "-m".into(),
            "state".into(),
            "--state".into(),
            "RELATED,ESTABLISHED".into(),
            "-i".into(),
            device.into(),
            "-j".into(),
            "ACCEPT".into(),
        ],
        vec!["-i".into(), device.into(), "-j".into(), "DROP".into()],
    ]
}

/// The spec allowing ICMPv6 on the VPN device, needed for neighbor discovery
/// toward the bonding peers.
pub fn icmpv6_accept_spec(device: &str) -> Vec<String> {
    vec![
        "-i".into(),
        device.into(),
        "-p".into(),
        "icmpv6".into(),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

fn as_refs(spec: &[String]) -> Vec<&str> {
    spec.iter().map(String::as_str).collect()
}

async fn append_unique(ipt: &Iptables, table: &str, chain: &str, spec: &[String]) -> Result<(), FirewallError> {
    ipt.append_unique(table, chain, &as_refs(spec)).await?;
    Ok(())
}

fn netmap_prerouting(device: &str, entry: &NetmapEntry, reverse: bool) -> (Vec<String>, Vec<String>) {
    let (match_net, map_net) = if reverse {
        (entry.dst, entry.src)
    } else {
        (entry.src, entry.dst)
    };
    let pre = vec![
        "--in-interface".into(),
        device.into(),
        "-d".into(),
        match_net.to_string(),
        "-j".into(),
        "NETMAP".into(),
        "--to".into(),
        map_net.to_string(),
    ];
    let post = vec![
        "--out-interface".into(),
        device.into(),
        "-s".into(),
        map_net.to_string(),
        "-j".into(),
        "NETMAP".into(),
        "--to".into(),
        match_net.to_string(),
    ];
    (pre, post)
}

/// Installs the iptables rules of the VPN client roles (seed and shoot side).
pub async fn set_client_rules(cfg: &ClientConfig) -> Result<(), FirewallError> {
    // In HA mode the traffic leaves through the per-peer bond0ip6tnl devices
    // whose names are not known up front, so a prefix wildcard is used.
    let forward_device = if cfg.vpn_server_index.is_some() {
        format!("{BOND_DEVICE}+")
    } else {
        TUNNEL_DEVICE.to_string()
    };

    let shoot_networks: Vec<_> = cfg
        .shoot_pod_networks
        .iter()
        .chain(&cfg.shoot_service_networks)
        .chain(&cfg.shoot_node_networks)
        .copied()
        .collect();
    let overlap = overlaps_any(&cfg.seed_pod_network, &shoot_networks);

    for family in &cfg.ip_families {
        let ipt = Iptables::new(*family).await?;

        if cfg.is_shoot_client {
            set_shoot_client_rules(&ipt, cfg, &forward_device, overlap).await?;
        } else {
            set_seed_client_rules(&ipt, cfg, &forward_device, overlap).await?;
        }
    }
    Ok(())
}

async fn set_shoot_client_rules(
    ipt: &Iptables,
    cfg: &ClientConfig,
    forward_device: &str,
    overlap: bool,
) -> Result<(), FirewallError> {
    if ipt.family() == IpFamily::Ipv4 {
        let accept = vec![
            "--in-interface".to_string(),
            forward_device.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];
        append_unique(ipt, "filter", "FORWARD", &accept).await?;

        // The double NAT is needed unconditionally outside HA; in HA mode
        // only when the seed pod network collides with shoot space.
        if !cfg.is_ha || overlap {
            tracing::info!("setting up double NAT rules (shoot side)");
            let plans = shoot_networks_for_netmap(
                &cfg.shoot_pod_networks,
                &cfg.shoot_service_networks,
                &cfg.shoot_node_networks,
            )?;
            for entry in plans.pod.iter().chain(&plans.service).chain(&plans.node) {
                let (pre, post) = netmap_prerouting(forward_device, entry, true);
                append_unique(ipt, "nat", "PREROUTING", &pre).await?;
                append_unique(ipt, "nat", "POSTROUTING", &post).await?;
            }
        }
    }

    let clamp = vec![
        "-p".to_string(),
        "tcp".to_string(),
        "--tcp-flags".to_string(),
        "SYN,RST".to_string(),
        "SYN".to_string(),
        "-j".to_string(),
        "TCPMSS".to_string(),
        "--clamp-mss-to-pmtu".to_string(),
    ];
    append_unique(ipt, "filter", "FORWARD", &clamp).await?;

    let masquerade = vec![
        "--out-interface".to_string(),
        "eth0".to_string(),
        "-j".to_string(),
        "MASQUERADE".to_string(),
    ];
    append_unique(ipt, "nat", "POSTROUTING", &masquerade).await?;
    Ok(())
}

async fn set_seed_client_rules(
    ipt: &Iptables,
    cfg: &ClientConfig,
    forward_device: &str,
    overlap: bool,
) -> Result<(), FirewallError> {
    // Seed clients only exist in the HA deployment.
    if ipt.family() == IpFamily::Ipv4 && overlap {
        tracing::info!("setting up double NAT rules (seed side)");
        let plans = shoot_networks_for_netmap(
            &cfg.shoot_pod_networks,
            &cfg.shoot_service_networks,
            &cfg.shoot_node_networks,
        )?;
        let gid = ENVOY_VPN_GROUP_ID.to_string();
        for entry in plans.pod.iter().chain(&plans.service).chain(&plans.node) {
            let spec = vec![
                "-m".to_string(),
                "owner".to_string(),
                "--gid-owner".to_string(),
                gid.clone(),
                "-d".to_string(),
                entry.src.to_string(),
                "-j".to_string(),
                "NETMAP".to_string(),
                "--to".to_string(),
                entry.dst.to_string(),
            ];
            append_unique(ipt, "nat", "OUTPUT", &spec).await?;
        }

        if cfg.seed_pod_network.is_ipv4() {
            let pre = vec![
                "--in-interface".to_string(),
                forward_device.to_string(),
                "-d".to_string(),
                SEED_POD_NETWORK_MAPPED.to_string(),
                "-j".to_string(),
                "NETMAP".to_string(),
                "--to".to_string(),
                cfg.seed_pod_network.to_string(),
            ];
            let post = vec![
                "--out-interface".to_string(),
                forward_device.to_string(),
                "-s".to_string(),
                cfg.seed_pod_network.to_string(),
                "-j".to_string(),
                "NETMAP".to_string(),
                "--to".to_string(),
                SEED_POD_NETWORK_MAPPED.to_string(),
            ];
            append_unique(ipt, "nat", "PREROUTING", &pre).await?;
            append_unique(ipt, "nat", "POSTROUTING", &post).await?;
        }
    }

    if ipt.family() == IpFamily::Ipv6 {
        append_unique(ipt, "filter", "INPUT", &icmpv6_accept_spec(forward_device)).await?;
    }
    for spec in input_chain_specs(forward_device) {
        append_unique(ipt, "filter", "INPUT", &spec).await?;
    }
    Ok(())
}

/// Installs the non-HA seed-server NETMAP rules: traffic of the proxy user
/// toward shoot space is rewritten into the reserved ranges before it enters
/// the tunnel.
pub async fn set_server_rules(
    shoot_pod_networks: &[Cidr],
    shoot_service_networks: &[Cidr],
    shoot_node_networks: &[Cidr],
) -> Result<(), FirewallError> {
    tracing::info!("setting up double NAT rules (non-HA server)");
    let ipt = Iptables::new(IpFamily::Ipv4).await?;
    let plans =
        shoot_networks_for_netmap(shoot_pod_networks, shoot_service_networks, shoot_node_networks)?;
    let uid = ENVOY_NON_ROOT_USER_ID.to_string();
    for entry in plans.pod.iter().chain(&plans.service).chain(&plans.node) {
        let spec = vec![
            "-m".to_string(),
            "owner".to_string(),
            "--uid-owner".to_string(),
            uid.clone(),
            "-d".to_string(),
            entry.src.to_string(),
            "-j".to_string(),
            "NETMAP".to_string(),
            "--to".to_string(),
            entry.dst.to_string(),
        ];
        append_unique(&ipt, "nat", "OUTPUT", &spec).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_chain_lockdown_shape() {
        let specs = input_chain_specs("tun0");
        assert_eq!(specs.len(), 2);
        assert_eq!(
            specs[0],
            vec!["-m", "state", "--state", "RELATED,ESTABLISHED", "-i", "tun0", "-j", "ACCEPT"]
        );
        assert_eq!(specs[1], vec!["-i", "tun0", "-j", "DROP"]);
    }

    #[test]
    fn netmap_rules_are_symmetric() {
        let entry = NetmapEntry {
            src: "100.96.0.0/11".parse().unwrap(),
            dst: "244.0.0.0/11".parse().unwrap(),
        };
        let (pre, post) = netmap_prerouting("bond0+", &entry, true);
        assert_eq!(
            pre,
            vec!["--in-interface", "bond0+", "-d", "244.0.0.0/11", "-j", "NETMAP", "--to", "100.96.0.0/11"]
        );
        assert_eq!(
            post,
            vec!["--out-interface", "bond0+", "-s", "100.96.0.0/11", "-j", "NETMAP", "--to", "244.0.0.0/11"]
        );
    }
}
