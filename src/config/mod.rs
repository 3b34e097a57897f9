//! Role configuration parsed from environment variables.
//!
//! Each role (client, server, path controller) has its own struct with a
//! `from_env` constructor. Parsing is separated from the environment lookup
//! so tests can feed a plain map.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::Ipv6Net;
use thiserror::Error;

use crate::network::address::VPN_NETWORK_PREFIX;
use crate::network::cidr::{parse_cidr_list, Cidr, IpFamily};
use crate::network::netlink::BondMode;

const DEFAULT_VPN_NETWORK: &str = "fd8f:6d53:b97a:1::/96";
const DEFAULT_OPENVPN_PORT: u16 = 8132;
const DEFAULT_POD_LABEL_SELECTOR: &str = "app=kubernetes,role=apiserver";
const DEFAULT_REVERSED_VPN_HEADER: &str = "invalid-host";
const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(2);
const DEFAULT_SHOOT_SERVICE_NETWORKS: &str = "100.64.0.0/13";
const DEFAULT_SHOOT_POD_NETWORKS: &str = "100.96.0.0/11";
const DEFAULT_LOCAL_NODE_IP: &str = "255.255.255.255";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Incoherent(String),
}

/// Configuration of the VPN client roles (seed-side and shoot-side).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ip_families: Vec<IpFamily>,
    pub endpoint: Option<String>,
    pub openvpn_port: u16,
    pub vpn_network: Ipv6Net,
    pub seed_pod_network: Cidr,
    pub shoot_service_networks: Vec<Cidr>,
    pub shoot_pod_networks: Vec<Cidr>,
    pub shoot_node_networks: Vec<Cidr>,
    pub is_shoot_client: bool,
    pub pod_name: String,
    pub namespace: String,
    pub vpn_server_index: Option<String>,
    pub vpn_client_index: Option<u8>,
    pub is_ha: bool,
    pub reversed_vpn_header: String,
    pub ha_vpn_clients: u8,
    pub ha_vpn_servers: u8,
    pub pod_label_selector: String,
    pub wait_time: Duration,
    pub pod_ip: Option<IpAddr>,
    pub bonding_mode: BondMode,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup())
    }

    pub fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let reader = EnvReader { get: env };

        let ip_families = reader.ip_families()?;
        let vpn_network = reader.vpn_network()?;

        let pod_name = reader.string("POD_NAME").unwrap_or_default();
        let vpn_client_index = pod_name_index(&pod_name);

        let cfg = ClientConfig {
            ip_families,
            endpoint: reader.string("ENDPOINT"),
            openvpn_port: reader.parse("OPENVPN_PORT")?.unwrap_or(DEFAULT_OPENVPN_PORT),
            vpn_network,
            seed_pod_network: reader.cidr("SEED_POD_NETWORK")?,
            shoot_service_networks: reader.cidr_list("SHOOT_SERVICE_NETWORKS")?,
            shoot_pod_networks: reader.cidr_list("SHOOT_POD_NETWORKS")?,
            shoot_node_networks: reader.cidr_list("SHOOT_NODE_NETWORKS")?,
            is_shoot_client: reader.bool("IS_SHOOT_CLIENT")?,
            pod_name,
            namespace: reader.string("NAMESPACE").unwrap_or_default(),
            vpn_server_index: reader.string("VPN_SERVER_INDEX"),
            vpn_client_index,
            is_ha: reader.bool("IS_HA")?,
            reversed_vpn_header: reader
                .string("REVERSED_VPN_HEADER")
                .unwrap_or_else(|| DEFAULT_REVERSED_VPN_HEADER.to_string()),
            ha_vpn_clients: reader.parse("HA_VPN_CLIENTS")?.unwrap_or(0),
            ha_vpn_servers: reader.parse("HA_VPN_SERVERS")?.unwrap_or(0),
            pod_label_selector: reader
                .string("POD_LABEL_SELECTOR")
                .unwrap_or_else(|| DEFAULT_POD_LABEL_SELECTOR.to_string()),
            wait_time: reader.duration("WAIT_TIME")?.unwrap_or(DEFAULT_WAIT_TIME),
            pod_ip: reader.parse("POD_IP")?,
            bonding_mode: reader.bond_mode()?,
        };

        if cfg.is_ha {
            if cfg.is_shoot_client && cfg.pod_name.is_empty() {
                return Err(ConfigError::Incoherent(
                    "IS_HA and IS_SHOOT_CLIENT are set but POD_NAME is not".to_string(),
                ));
            }
            if cfg.ha_vpn_servers > 0 && cfg.ha_vpn_clients == 0 {
                return Err(ConfigError::Incoherent(format!(
                    "HA_VPN_SERVERS is set to {} but HA_VPN_CLIENTS is 0",
                    cfg.ha_vpn_servers
                )));
            }
            if cfg.ha_vpn_clients > 0 && cfg.ha_vpn_servers == 0 {
                return Err(ConfigError::Incoherent(format!(
                    "HA_VPN_CLIENTS is set to {} but HA_VPN_SERVERS is 0",
                    cfg.ha_vpn_clients
                )));
            }
        }

        Ok(cfg)
    }

    pub fn primary_ip_family(&self) -> IpFamily {
        self.ip_families[0]
    }
}

/// Configuration of the seed-server role.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub shoot_service_networks: Vec<Cidr>,
    pub shoot_pod_networks: Vec<Cidr>,
    pub shoot_node_networks: Vec<Cidr>,
    pub vpn_network: Ipv6Net,
    pub seed_pod_network: Cidr,
    pub pod_name: String,
    pub status_path: String,
    pub is_ha: bool,
    pub ha_vpn_clients: u8,
    pub local_node_ip: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup())
    }

    pub fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let reader = EnvReader { get: env };

        let cfg = ServerConfig {
            shoot_service_networks: reader
                .cidr_list_or("SHOOT_SERVICE_NETWORKS", DEFAULT_SHOOT_SERVICE_NETWORKS)?,
            shoot_pod_networks: reader
                .cidr_list_or("SHOOT_POD_NETWORKS", DEFAULT_SHOOT_POD_NETWORKS)?,
            shoot_node_networks: reader.cidr_list("SHOOT_NODE_NETWORKS")?,
            vpn_network: reader.vpn_network()?,
            seed_pod_network: reader.cidr("SEED_POD_NETWORK")?,
            pod_name: reader.string("POD_NAME").unwrap_or_default(),
            status_path: reader.string("OPENVPN_STATUS_PATH").unwrap_or_default(),
            is_ha: reader.bool("IS_HA")?,
            ha_vpn_clients: reader.parse("HA_VPN_CLIENTS")?.unwrap_or(0),
            local_node_ip: reader
                .string("LOCAL_NODE_IP")
                .unwrap_or_else(|| DEFAULT_LOCAL_NODE_IP.to_string()),
        };

        if cfg.is_ha {
            if cfg.pod_name.is_empty() {
                return Err(ConfigError::Incoherent(
                    "IS_HA is set but POD_NAME is not".to_string(),
                ));
            }
            if cfg.ha_vpn_clients == 0 {
                return Err(ConfigError::Incoherent(
                    "IS_HA is set but HA_VPN_CLIENTS is not".to_string(),
                ));
            }
            if cfg.status_path.is_empty() {
                return Err(ConfigError::Incoherent(
                    "IS_HA is set but OPENVPN_STATUS_PATH is not".to_string(),
                ));
            }
        }

        Ok(cfg)
    }

    /// VPN server index encoded in the trailing `-N` of the pod name; HA
    /// seed pods are stateful-set members and always carry one.
    pub fn vpn_index(&self) -> Option<u8> {
        pod_name_index(&self.pod_name)
    }
}

/// Configuration of the seed-side path controller.
#[derive(Debug, Clone)]
pub struct PathControllerConfig {
    pub ip_families: Vec<IpFamily>,
    pub vpn_network: Ipv6Net,
    pub ha_vpn_clients: u8,
    pub seed_pod_network: Cidr,
    pub shoot_service_networks: Vec<Cidr>,
    pub shoot_pod_networks: Vec<Cidr>,
    pub shoot_node_networks: Vec<Cidr>,
    pub pod_ip: IpAddr,
}

impl PathControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup())
    }

    pub fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let reader = EnvReader { get: env };
        Ok(PathControllerConfig {
            ip_families: reader.ip_families()?,
            vpn_network: reader.vpn_network()?,
            ha_vpn_clients: reader.parse("HA_VPN_CLIENTS")?.unwrap_or(0),
            seed_pod_network: reader.cidr("SEED_POD_NETWORK")?,
            shoot_service_networks: reader.cidr_list("SHOOT_SERVICE_NETWORKS")?,
            shoot_pod_networks: reader.cidr_list("SHOOT_POD_NETWORKS")?,
            shoot_node_networks: reader.cidr_list("SHOOT_NODE_NETWORKS")?,
            pod_ip: reader
                .parse("POD_IP")?
                .ok_or(ConfigError::Missing("POD_IP"))?,
        })
    }
}

fn env_lookup() -> impl Fn(&str) -> Option<String> {
    |name: &str| std::env::var(name).ok()
}

fn pod_name_index(pod_name: &str) -> Option<u8> {
    pod_name.rsplit('-').next()?.parse().ok()
}

struct EnvReader<'a> {
    get: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.get)(name).filter(|value| !value.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(name) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| ConfigError::Invalid {
                name,
                value,
                reason: format!("expected {}", std::any::type_name::<T>()),
            }),
        }
    }

    fn bool(&self, name: &'static str) -> Result<bool, ConfigError> {
        match self.string(name).as_deref() {
            None => Ok(false),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                name,
                value: other.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        }
    }

    fn duration(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        let Some(value) = self.string(name) else {
            return Ok(None);
        };
        parse_duration(&value)
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid {
                name,
                value,
                reason: "expected a non-negative duration such as 2s or 500ms".to_string(),
            })
    }

    fn cidr(&self, name: &'static str) -> Result<Cidr, ConfigError> {
        match self.string(name) {
            None => Ok(Cidr::empty()),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name,
                value,
                reason: "expected a CIDR".to_string(),
            }),
        }
    }

    fn cidr_list(&self, name: &'static str) -> Result<Vec<Cidr>, ConfigError> {
        match self.string(name) {
            None => Ok(Vec::new()),
            Some(value) => parse_cidr_list(&value).map_err(|e| ConfigError::Invalid {
                name,
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn cidr_list_or(&self, name: &'static str, default: &str) -> Result<Vec<Cidr>, ConfigError> {
        match self.string(name) {
            None => parse_cidr_list(default).map_err(|e| ConfigError::Invalid {
                name,
                value: default.to_string(),
                reason: e.to_string(),
            }),
            Some(value) => parse_cidr_list(&value).map_err(|e| ConfigError::Invalid {
                name,
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn ip_families(&self) -> Result<Vec<IpFamily>, ConfigError> {
        let raw = self
            .string("IP_FAMILIES")
            .unwrap_or_else(|| "IPv4".to_string());
        let mut families = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            families.push(part.parse::<IpFamily>().map_err(|_| ConfigError::Invalid {
                name: "IP_FAMILIES",
                value: raw.clone(),
                reason: format!("unknown family {part:?}, expected IPv4 or IPv6"),
            })?);
        }
        if families.is_empty() || families.len() > 2 {
            return Err(ConfigError::Invalid {
                name: "IP_FAMILIES",
                value: raw,
                reason: "must contain one or two families".to_string(),
            });
        }
        families.sort();
        families.dedup();
        Ok(families)
    }

    fn vpn_network(&self) -> Result<Ipv6Net, ConfigError> {
        let raw = self
            .string("VPN_NETWORK")
            .unwrap_or_else(|| DEFAULT_VPN_NETWORK.to_string());
        let net: Ipv6Net = raw.parse().map_err(|_| ConfigError::Invalid {
            name: "VPN_NETWORK",
            value: raw.clone(),
            reason: "expected an IPv6 CIDR".to_string(),
        })?;
        if net.prefix_len() != VPN_NETWORK_PREFIX {
            return Err(ConfigError::Invalid {
                name: "VPN_NETWORK",
                value: raw,
                reason: format!("vpn network must have a /{VPN_NETWORK_PREFIX} prefix"),
            });
        }
        Ok(net)
    }

    fn bond_mode(&self) -> Result<BondMode, ConfigError> {
        match self.string("BONDING_MODE") {
            None => Ok(BondMode::default()),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "BONDING_MODE",
                value,
                reason: "expected active-backup or balance-rr".to_string(),
            }),
        }
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    if let Some(millis) = value.strip_suffix("ms") {
        return millis.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(minutes) = value.strip_suffix('m') {
        let minutes: u64 = minutes.trim().parse().ok()?;
        return Some(Duration::from_secs(minutes * 60));
    }
    value.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
pub(crate) fn map_lookup(
    map: std::collections::HashMap<&'static str, &'static str>,
) -> impl Fn(&str) -> Option<String> {
    move |name: &str| map.get(name).map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("IP_FAMILIES", "IPv4"),
            ("SHOOT_POD_NETWORKS", "100.96.0.0/11"),
            ("SHOOT_SERVICE_NETWORKS", "100.64.0.0/13"),
            ("SEED_POD_NETWORK", "10.1.0.0/16"),
        ])
    }

    #[test]
    fn client_defaults() {
        let cfg = ClientConfig::from_lookup(&map_lookup(base_env())).unwrap();
        assert_eq!(cfg.vpn_network.to_string(), "fd8f:6d53:b97a:1::/96");
        assert_eq!(cfg.openvpn_port, 8132);
        assert_eq!(cfg.wait_time, Duration::from_secs(2));
        assert_eq!(cfg.reversed_vpn_header, "invalid-host");
        assert_eq!(cfg.pod_label_selector, "app=kubernetes,role=apiserver");
        assert_eq!(cfg.bonding_mode, BondMode::ActiveBackup);
        assert!(!cfg.is_ha);
    }

    #[test]
    fn vpn_network_must_be_a_96() {
        let mut env = base_env();
        env.insert("VPN_NETWORK", "fd8f:6d53:b97a:1::/120");
        assert!(ClientConfig::from_lookup(&map_lookup(env)).is_err());

        let mut env = base_env();
        env.insert("VPN_NETWORK", "10.0.0.0/8");
        assert!(ClientConfig::from_lookup(&map_lookup(env)).is_err());
    }

    #[test]
    fn ip_families_are_validated_and_deduped() {
        let mut env = base_env();
        env.insert("IP_FAMILIES", "IPv4,IPv4");
        let cfg = ClientConfig::from_lookup(&map_lookup(env)).unwrap();
        assert_eq!(cfg.ip_families, vec![IpFamily::Ipv4]);

        let mut env = base_env();
        env.insert("IP_FAMILIES", "IPv4,IPv5");
        assert!(ClientConfig::from_lookup(&map_lookup(env)).is_err());
    }

    #[test]
    fn ha_flags_must_be_coherent() {
        let mut env = base_env();
        env.insert("IS_HA", "true");
        env.insert("HA_VPN_SERVERS", "2");
        assert!(matches!(
            ClientConfig::from_lookup(&map_lookup(env)),
            Err(ConfigError::Incoherent(_))
        ));

        let mut env = base_env();
        env.insert("IS_HA", "true");
        env.insert("HA_VPN_CLIENTS", "2");
        assert!(matches!(
            ClientConfig::from_lookup(&map_lookup(env)),
            Err(ConfigError::Incoherent(_))
        ));

        let mut env = base_env();
        env.insert("IS_HA", "true");
        env.insert("HA_VPN_SERVERS", "2");
        env.insert("HA_VPN_CLIENTS", "2");
        let cfg = ClientConfig::from_lookup(&map_lookup(env)).unwrap();
        assert_eq!((cfg.ha_vpn_servers, cfg.ha_vpn_clients), (2, 2));
    }

    #[test]
    fn client_index_comes_from_pod_name() {
        let mut env = base_env();
        env.insert("POD_NAME", "vpn-shoot-client-1");
        let cfg = ClientConfig::from_lookup(&map_lookup(env)).unwrap();
        assert_eq!(cfg.vpn_client_index, Some(1));

        let mut env = base_env();
        env.insert("POD_NAME", "vpn-shoot");
        let cfg = ClientConfig::from_lookup(&map_lookup(env)).unwrap();
        assert_eq!(cfg.vpn_client_index, None);
    }

    #[test]
    fn wait_time_formats() {
        for (raw, expected) in [
            ("2s", Duration::from_secs(2)),
            ("1500ms", Duration::from_millis(1500)),
            ("1m", Duration::from_secs(60)),
            ("3", Duration::from_secs(3)),
        ] {
            let mut env = base_env();
            env.insert("WAIT_TIME", raw);
            let cfg = ClientConfig::from_lookup(&map_lookup(env)).unwrap();
            assert_eq!(cfg.wait_time, expected, "{raw}");
        }

        let mut env = base_env();
        env.insert("WAIT_TIME", "-2s");
        assert!(ClientConfig::from_lookup(&map_lookup(env)).is_err());
    }

    #[test]
    fn server_requires_ha_fields() {
        let mut env = base_env();
        env.insert("IS_HA", "true");
        env.insert("POD_NAME", "vpn-seed-server-0");
        env.insert("HA_VPN_CLIENTS", "2");
        assert!(matches!(
            ServerConfig::from_lookup(&map_lookup(env.clone())),
            Err(ConfigError::Incoherent(_))
        ));

        env.insert("OPENVPN_STATUS_PATH", "/srv/status/openvpn.status");
        let cfg = ServerConfig::from_lookup(&map_lookup(env)).unwrap();
        assert_eq!(cfg.vpn_index(), Some(0));
    }

    #[test]
    fn path_controller_requires_pod_ip() {
        assert!(matches!(
            PathControllerConfig::from_lookup(&map_lookup(base_env())),
            Err(ConfigError::Missing("POD_IP"))
        ));

        let mut env = base_env();
        env.insert("POD_IP", "10.1.0.5");
        let cfg = PathControllerConfig::from_lookup(&map_lookup(env)).unwrap();
        assert_eq!(cfg.pod_ip.to_string(), "10.1.0.5");
    }
}
