//! Thin adapter over the kernel networking surface.
//!
//! Link lookup/deletion, addresses and routes go through a persistent
//! rtnetlink connection. Link types without an rtnetlink builder (tap, bond
//! with options, ip6tnl) are created by shelling out to `ip` respectively
//! `openvpn --mktun`; both tools are present in the images this runs in.

use std::net::{IpAddr, Ipv6Addr};

use futures::TryStreamExt;
use ipnet::{IpNet, Ipv6Net};
use netlink_packet_route::address::nlas::Nla as AddressNla;
use tokio::process::Command;

use crate::network::error::{NetworkError, NetworkResult};

pub const SCOPE_UNIVERSE: u8 = 0;
pub const SCOPE_LINK: u8 = 253;

// IFA_F_* address flag bits as reported over netlink.
const ADDR_FLAG_NAMES: &[(u32, &str)] = &[
    (0x01, "secondary"),
    (0x02, "nodad"),
    (0x04, "optimistic"),
    (0x08, "dadfailed"),
    (0x10, "homeaddress"),
    (0x20, "deprecated"),
    (0x40, "tentative"),
    (0x80, "permanent"),
    (0x100, "managetempaddr"),
    (0x200, "noprefixroute"),
    (0x400, "mcautojoin"),
    (0x800, "stable_privacy"),
];

/// Bonding mode of the aggregate device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondMode {
    /// Carrier-monitored failover with one active slave at a time.
    #[default]
    ActiveBackup,
    /// Round-robin transmission over all slaves.
    BalanceRr,
}

impl BondMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BondMode::ActiveBackup => "active-backup",
            BondMode::BalanceRr => "balance-rr",
        }
    }
}

impl std::str::FromStr for BondMode {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetworkResult<Self> {
        match s {
            "active-backup" => Ok(BondMode::ActiveBackup),
            "balance-rr" => Ok(BondMode::BalanceRr),
            other => Err(NetworkError::Validation(format!(
                "unknown bonding mode {other:?}, expected active-backup or balance-rr"
            ))),
        }
    }
}

/// An address assigned to a link, with its netlink scope and IFA flags.
#[derive(Debug, Clone, Copy)]
pub struct LinkAddress {
    pub ip: IpAddr,
    pub scope: u8,
    pub flags: u32,
}

impl LinkAddress {
    pub fn flags_string(&self) -> String {
        let names: Vec<&str> = ADDR_FLAG_NAMES
            .iter()
            .filter(|&&(bit, _)| self.flags & bit != 0)
            .map(|&(_, name)| name)
            .collect();
        names.join(" ")
    }
}

/// Persistent netlink handle for all link/address/route operations.
/// One handle per process, shared across the controllers.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// Get a link's ifindex by name. Returns NotFound if the link doesn't exist.
    pub async fn link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {name}"))),
            Err(e) => {
                // rtnetlink reports "not found" as an error on some kernels
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {name}")))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    pub async fn link_exists(&self, name: &str) -> bool {
        self.link_index(name).await.is_ok()
    }

    /// Delete a link by name. Idempotent - returns Ok if the link doesn't exist.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn set_link_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Enslave a link to a master device (bond aggregate).
    pub async fn set_link_master(&self, link_index: u32, master_index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(link_index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Add an address to a link. Idempotent for already assigned addresses.
    pub async fn add_address(&self, link_index: u32, addr: IpAddr, prefix_len: u8) -> NetworkResult<()> {
        let result = self
            .handle
            .address()
            .add(link_index, addr, prefix_len)
            .execute()
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Add an IPv6 address with the NODAD flag. Goes through `ip` because the
    /// rtnetlink address builder does not expose IFA flags.
    pub async fn add_address_nodad(&self, link_name: &str, addr: Ipv6Net) -> NetworkResult<()> {
        let addr = format!("{}/{}", addr.addr(), addr.prefix_len());
        match self
            .run("ip", &["-6", "addr", "add", &addr, "dev", link_name, "nodad"])
            .await
        {
            Ok(()) => Ok(()),
            Err(NetworkError::Command { stderr, .. }) if stderr.contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// List the addresses of a link, restricted to one netlink scope.
    pub async fn list_addresses(&self, link_name: &str, scope: u8) -> NetworkResult<Vec<LinkAddress>> {
        let index = self.link_index(link_name).await?;
        let mut request = self.handle.address().get();
        request = request.set_link_index_filter(index);

        let mut addresses = Vec::new();
        let mut stream = request.execute();
        while let Some(msg) = stream.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.scope != scope {
                continue;
            }
            let mut ip = None;
            let mut flags = u32::from(msg.header.flags);
            for nla in &msg.nlas {
                match nla {
                    AddressNla::Address(bytes) => ip = ip_from_bytes(bytes),
                    AddressNla::Flags(full) => flags = *full,
                    _ => {}
                }
            }
            if let Some(ip) = ip {
                addresses.push(LinkAddress { ip, scope: msg.header.scope, flags });
            }
        }
        Ok(addresses)
    }

    /// Create a persistent tap device. The device survives this process, so
    /// callers delete-if-exists before creating.
    pub async fn create_tap(&self, name: &str) -> NetworkResult<()> {
        self.run("openvpn", &["--mktun", "--dev", name]).await
    }

    /// Create the bonding aggregate. Active-backup uses carrier-based MII
    /// monitoring, keeps the MAC of the active slave and announces failover
    /// with gratuitous ARP; balance-rr only monitors the carrier.
    pub async fn create_bond(&self, name: &str, mode: BondMode) -> NetworkResult<()> {
        match mode {
            BondMode::ActiveBackup => {
                self.run(
                    "ip",
                    &[
                        "link", "add", name, "type", "bond", "mode", "active-backup", "miimon",
                        "100", "fail_over_mac", "active", "num_grat_arp", "5",
                    ],
                )
                .await
            }
            BondMode::BalanceRr => {
                self.run(
                    "ip",
                    &["link", "add", name, "type", "bond", "mode", "balance-rr", "miimon", "100"],
                )
                .await
            }
        }
    }

    /// Name the primary slave of an active-backup bond.
    pub async fn set_bond_primary(&self, bond: &str, slave: &str) -> NetworkResult<()> {
        self.run("ip", &["link", "set", bond, "type", "bond", "primary", slave])
            .await
    }

    /// Create an IP-in-IPv6 tunnel carrying v4 or v6 payloads, and set it up.
    pub async fn create_ip6_tunnel(
        &self,
        name: &str,
        local: Ipv6Addr,
        remote: Ipv6Addr,
    ) -> NetworkResult<()> {
        let local = local.to_string();
        let remote = remote.to_string();
        self.run(
            "ip",
            &["-6", "tunnel", "add", name, "mode", "ip6tnl", "local", &local, "remote", &remote],
        )
        .await?;
        let index = self.link_index(name).await?;
        self.set_link_up(index).await
    }

    /// Install a route to `dst` via the given link. REPLACE semantics: the
    /// operation is idempotent and atomically swaps an existing route.
    pub async fn replace_route(&self, dst: IpNet, link_index: u32) -> NetworkResult<()> {
        tracing::debug!(%dst, link_index, "replacing route");
        match dst {
            IpNet::V4(net) => self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(net.addr(), net.prefix_len())
                .output_interface(link_index)
                .replace()
                .execute()
                .await
                .map_err(NetworkError::Netlink),
            IpNet::V6(net) => self
                .handle
                .route()
                .add()
                .v6()
                .destination_prefix(net.addr(), net.prefix_len())
                .output_interface(link_index)
                .replace()
                .execute()
                .await
                .map_err(NetworkError::Netlink),
        }
    }

    /// Route replacement by device name, used by the OpenVPN up hook.
    pub async fn replace_route_via(&self, dst: IpNet, link_name: &str) -> NetworkResult<()> {
        let index = self.link_index(link_name).await?;
        self.replace_route(dst, index).await
    }

    async fn run(&self, program: &str, args: &[&str]) -> NetworkResult<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(NetworkError::Io)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Command {
                cmd: format!("{program} {}", args.join(" ")),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bond_mode_parsing() {
        assert_eq!("active-backup".parse::<BondMode>().unwrap(), BondMode::ActiveBackup);
        assert_eq!("balance-rr".parse::<BondMode>().unwrap(), BondMode::BalanceRr);
        assert!("802.3ad".parse::<BondMode>().is_err());
    }

    #[test]
    fn address_flags_render_by_name() {
        let addr = LinkAddress {
            ip: "fe80::1".parse().unwrap(),
            scope: SCOPE_LINK,
            flags: 0x40 | 0x02,
        };
        let rendered = addr.flags_string();
        assert!(rendered.contains("tentative"));
        assert!(rendered.contains("nodad"));
    }
}
