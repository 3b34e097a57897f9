//! Value objects consumed by the external OpenVPN launcher.
//!
//! The launcher renders these into the textual OpenVPN config; OpenVPN
//! rejects lines of 256 characters or more, so every network-derived line is
//! validated here before a value object leaves the builder.

use ipnet::{Ipv4Net, Ipv6Net};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ClientConfig, ServerConfig};
use crate::constants::{SEED_POD_NETWORK_MAPPED, TUNNEL_DEVICE};
use crate::network::address::ha_tunnel_network;
use crate::network::cidr::IpFamily;

pub const MAX_CONFIG_LINE_LENGTH: usize = 256;

#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("config line exceeds {MAX_CONFIG_LINE_LENGTH} characters: {0:?}")]
    LineTooLong(String),
    #[error("IS_HA is set but the pod name carries no VPN index")]
    MissingVpnIndex,
}

/// Inputs of the seed-server OpenVPN config.
#[derive(Debug, Clone, Serialize)]
pub struct SeedServerValues {
    pub device: String,
    pub status_path: String,
    /// Transfer network of this VPN server (per-index /112 in HA mode, the
    /// whole VPN network otherwise).
    pub openvpn_network: Ipv6Net,
    pub shoot_networks_v4: Vec<Ipv4Net>,
    pub shoot_networks_v6: Vec<Ipv6Net>,
    pub seed_pod_network_mapped: String,
    pub is_ha: bool,
    pub vpn_index: Option<u8>,
    pub ha_vpn_clients: Option<u8>,
    pub local_node_ip: String,
}

pub fn build_server_values(cfg: &ServerConfig) -> Result<SeedServerValues, ValuesError> {
    let mut shoot_networks_v4 = Vec::new();
    let mut shoot_networks_v6 = Vec::new();
    for network in cfg
        .shoot_service_networks
        .iter()
        .chain(&cfg.shoot_pod_networks)
        .chain(&cfg.shoot_node_networks)
    {
        if let Some(v4) = network.as_ipv4() {
            shoot_networks_v4.push(v4);
        } else if let Some(v6) = network.as_ipv6() {
            shoot_networks_v6.push(v6);
        }
    }

    let (device, vpn_index, ha_vpn_clients, openvpn_network) = if cfg.is_ha {
        let index = cfg.vpn_index().ok_or(ValuesError::MissingVpnIndex)?;
        (
            "tap0".to_string(),
            Some(index),
            Some(cfg.ha_vpn_clients),
            ha_tunnel_network(&cfg.vpn_network, index),
        )
    } else {
        (TUNNEL_DEVICE.to_string(), None, None, cfg.vpn_network)
    };

    let values = SeedServerValues {
        device,
        status_path: cfg.status_path.clone(),
        openvpn_network,
        shoot_networks_v4,
        shoot_networks_v6,
        seed_pod_network_mapped: SEED_POD_NETWORK_MAPPED.to_string(),
        is_ha: cfg.is_ha,
        vpn_index,
        ha_vpn_clients,
        local_node_ip: cfg.local_node_ip.clone(),
    };
    validate_lines(&values.config_lines())?;
    Ok(values)
}

impl SeedServerValues {
    /// The network-derived lines of the rendered server config.
    fn config_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("dev {}", self.device),
            format!("server-ipv6 {}", self.openvpn_network),
        ];
        for network in &self.shoot_networks_v4 {
            lines.push(format!("route {} {}", network.network(), network.netmask()));
        }
        for network in &self.shoot_networks_v6 {
            lines.push(format!("route-ipv6 {network}"));
        }
        if !self.status_path.is_empty() {
            lines.push(format!("status {} {}", self.status_path, super::health::STATUS_UPDATE_INTERVAL));
        }
        lines
    }
}

/// Inputs of the client OpenVPN config (both seed and shoot clients).
#[derive(Debug, Clone, Serialize)]
pub struct ClientValues {
    pub device: String,
    pub ip_family: IpFamily,
    pub reversed_vpn_header: String,
    pub endpoint: Option<String>,
    pub openvpn_port: u16,
    pub vpn_client_index: Option<u8>,
    pub is_shoot_client: bool,
    pub is_ha: bool,
    pub seed_pod_network: String,
}

pub fn build_client_values(cfg: &ClientConfig) -> Result<ClientValues, ValuesError> {
    let device = match &cfg.vpn_server_index {
        Some(index) => format!("tap{index}"),
        None => TUNNEL_DEVICE.to_string(),
    };

    let values = ClientValues {
        device,
        ip_family: cfg.primary_ip_family(),
        reversed_vpn_header: cfg.reversed_vpn_header.clone(),
        endpoint: cfg.endpoint.clone(),
        openvpn_port: cfg.openvpn_port,
        vpn_client_index: cfg.vpn_client_index,
        is_shoot_client: cfg.is_shoot_client,
        is_ha: cfg.is_ha,
        seed_pod_network: cfg.seed_pod_network.to_string(),
    };
    validate_lines(&values.config_lines())?;
    Ok(values)
}

impl ClientValues {
    fn config_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("dev {}", self.device)];
        if let Some(endpoint) = &self.endpoint {
            lines.push(format!("remote {endpoint} {}", self.openvpn_port));
            lines.push(format!(
                "http-proxy {endpoint} {}",
                self.openvpn_port
            ));
        }
        lines.push(format!(
            "http-proxy-option CUSTOM-HEADER Reversed-VPN {}",
            self.reversed_vpn_header
        ));
        if !self.seed_pod_network.is_empty() {
            lines.push(format!("route {}", self.seed_pod_network));
        }
        lines
    }
}

fn validate_lines(lines: &[String]) -> Result<(), ValuesError> {
    for line in lines {
        if line.len() >= MAX_CONFIG_LINE_LENGTH {
            return Err(ValuesError::LineTooLong(line.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::map_lookup;

    fn server_env(is_ha: bool) -> HashMap<&'static str, &'static str> {
        let mut env = HashMap::from([
            ("SHOOT_SERVICE_NETWORKS", "100.64.0.0/13"),
            ("SHOOT_POD_NETWORKS", "100.96.0.0/11"),
            ("SHOOT_NODE_NETWORKS", "10.250.0.0/16"),
            ("OPENVPN_STATUS_PATH", "/srv/status/openvpn.status"),
        ]);
        if is_ha {
            env.insert("IS_HA", "true");
            env.insert("POD_NAME", "vpn-seed-server-1");
            env.insert("HA_VPN_CLIENTS", "2");
        }
        env
    }

    #[test]
    fn non_ha_server_values() {
        let cfg = ServerConfig::from_lookup(&map_lookup(server_env(false))).unwrap();
        let values = build_server_values(&cfg).unwrap();
        assert_eq!(values.device, "tun0");
        assert_eq!(values.openvpn_network.to_string(), "fd8f:6d53:b97a:1::/96");
        assert_eq!(values.shoot_networks_v4.len(), 3);
        assert!(values.shoot_networks_v6.is_empty());
        assert_eq!(values.ha_vpn_clients, None);
        assert_eq!(values.seed_pod_network_mapped, "241.0.0.0/8");
    }

    #[test]
    fn ha_server_uses_indexed_tunnel_network() {
        let cfg = ServerConfig::from_lookup(&map_lookup(server_env(true))).unwrap();
        let values = build_server_values(&cfg).unwrap();
        assert_eq!(values.device, "tap0");
        assert_eq!(values.vpn_index, Some(1));
        assert_eq!(values.openvpn_network.to_string(), "fd8f:6d53:b97a:1::1:100/112");
        assert_eq!(values.ha_vpn_clients, Some(2));
    }

    #[test]
    fn v6_shoot_networks_are_split_out() {
        let mut env = server_env(false);
        env.insert("SHOOT_POD_NETWORKS", "100.96.0.0/11,2001:db8:1::/48");
        let cfg = ServerConfig::from_lookup(&map_lookup(env)).unwrap();
        let values = build_server_values(&cfg).unwrap();
        assert_eq!(values.shoot_networks_v4.len(), 2);
        assert_eq!(values.shoot_networks_v6.len(), 1);
    }

    #[test]
    fn client_device_follows_server_index() {
        let env = HashMap::from([("VPN_SERVER_INDEX", "1")]);
        let cfg = ClientConfig::from_lookup(&map_lookup(env)).unwrap();
        let values = build_client_values(&cfg).unwrap();
        assert_eq!(values.device, "tap1");

        let cfg = ClientConfig::from_lookup(&map_lookup(HashMap::new())).unwrap();
        let values = build_client_values(&cfg).unwrap();
        assert_eq!(values.device, "tun0");
    }

    #[test]
    fn oversized_lines_are_rejected() {
        let endpoint: &'static str =
            Box::leak(format!("api.{}.example.com", "x".repeat(300)).into_boxed_str());
        let env = HashMap::from([("ENDPOINT", endpoint)]);
        let cfg = ClientConfig::from_lookup(&map_lookup(env)).unwrap();
        assert!(matches!(
            build_client_values(&cfg),
            Err(ValuesError::LineTooLong(_))
        ));
    }
}
