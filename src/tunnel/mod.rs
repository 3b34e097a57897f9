//! Shoot-side tunnel controller.
//!
//! Seed peers advertise the kube-apiserver pod IP over UDP to the bonding
//! address of this pod. For every advertising source one IP-in-IPv6 tunnel
//! device and one host route to the advertised pod IP are materialised.
//! Failed materialisations back off for 30 seconds per peer; peers that
//! stop advertising are evicted together with their tunnel device.

pub mod readiness;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::constants::{BOND_DEVICE, TUNNEL_CONTROLLER_PORT};
use crate::network::address::bond_tunnel_link_name;
use crate::network::netlink::{NetlinkHandle, SCOPE_UNIVERSE};
use crate::network::{NetworkError, NetworkResult};

const CLEANUP_PERIOD: Duration = Duration::from_secs(15 * 60);
const EXPIRATION: Duration = Duration::from_secs(10 * 60);
const RETRY_BACKOFF: Duration = Duration::from_secs(30);
const BIND_ATTEMPTS: usize = 30;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("no universal-scope address on {BOND_DEVICE}")]
    NoBondAddress,
    #[error("expected an IPv6 address on {BOND_DEVICE}, got {0}")]
    NotIpv6(IpAddr),
    #[error("binding UDP port failed: {source} (address flags: {flags})")]
    Bind {
        source: std::io::Error,
        flags: String,
    },
}

/// Kernel operations needed to materialise a peer: the tunnel device and the
/// host route toward the advertised pod IP.
#[async_trait]
pub trait TunnelDevices: Send + Sync {
    async fn delete_link(&self, name: &str) -> NetworkResult<()>;
    async fn create_tunnel(&self, name: &str, local: Ipv6Addr, remote: Ipv6Addr)
        -> NetworkResult<()>;
    async fn replace_host_route(&self, dst: IpNet, link_name: &str) -> NetworkResult<()>;
}

#[async_trait]
impl TunnelDevices for NetlinkHandle {
    async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        NetlinkHandle::delete_link(self, name).await
    }

    async fn create_tunnel(
        &self,
        name: &str,
        local: Ipv6Addr,
        remote: Ipv6Addr,
    ) -> NetworkResult<()> {
        self.create_ip6_tunnel(name, local, remote).await
    }

    async fn replace_host_route(&self, dst: IpNet, link_name: &str) -> NetworkResult<()> {
        self.replace_route_via(dst, link_name).await
    }
}

struct Peer {
    local: Ipv6Addr,
    remote: Ipv6Addr,
    state: Mutex<PeerState>,
}

struct PeerState {
    pod_ip: String,
    last_seen: Instant,
    creation_complete: bool,
    last_creation_failed: Option<Instant>,
    creation_failed_count: u32,
    last_error: Option<String>,
}

impl PeerState {
    fn new(pod_ip: String) -> Self {
        Self {
            pod_ip,
            last_seen: Instant::now(),
            creation_complete: false,
            last_creation_failed: None,
            creation_failed_count: 0,
            last_error: None,
        }
    }

    fn set_failed(&mut self, error: String, now: Instant) {
        tracing::error!(error = %error, "tunnel update failed");
        self.last_creation_failed = Some(now);
        self.creation_failed_count += 1;
        self.last_error = Some(error);
    }
}

fn needs_update(state: &PeerState, new_pod_ip: &str, now: Instant) -> bool {
    if state.pod_ip != new_pod_ip {
        return true;
    }
    if state.creation_complete {
        return false;
    }
    match state.last_creation_failed {
        Some(failed) => now.duration_since(failed) > RETRY_BACKOFF,
        None => true,
    }
}

pub struct TunnelController {
    devices: Arc<dyn TunnelDevices>,
    peers: Mutex<HashMap<Ipv6Addr, Arc<Peer>>>,
    next_clean: Mutex<Instant>,
}

impl TunnelController {
    pub fn new(devices: Arc<dyn TunnelDevices>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            peers: Mutex::new(HashMap::new()),
            next_clean: Mutex::new(Instant::now() + CLEANUP_PERIOD),
        })
    }

    /// Binds the advertisement port on the bonding address and serves the
    /// accept loop. The bind is retried while the address finishes duplicate
    /// address detection; the address flags are reported if it never does.
    pub async fn run(self: Arc<Self>, netlink: Arc<NetlinkHandle>) -> Result<(), TunnelError> {
        let addresses = netlink.list_addresses(BOND_DEVICE, SCOPE_UNIVERSE).await?;
        let first = addresses.first().ok_or(TunnelError::NoBondAddress)?;
        let IpAddr::V6(local) = first.ip else {
            return Err(TunnelError::NotIpv6(first.ip));
        };

        let bind_addr = SocketAddrV6::new(local, TUNNEL_CONTROLLER_PORT, 0, 0);
        let mut socket = None;
        let mut last_error = None;
        for _ in 0..BIND_ATTEMPTS {
            match UdpSocket::bind(bind_addr).await {
                Ok(bound) => {
                    socket = Some(bound);
                    break;
                }
                Err(e) => {
                    last_error = Some(e);
                    sleep(BIND_RETRY_DELAY).await;
                }
            }
        }
        let Some(socket) = socket else {
            let flags = netlink
                .list_addresses(BOND_DEVICE, SCOPE_UNIVERSE)
                .await
                .ok()
                .and_then(|addrs| {
                    addrs
                        .iter()
                        .find(|a| a.ip == IpAddr::V6(local))
                        .map(|a| a.flags_string())
                })
                .unwrap_or_else(|| "unknown".to_string());
            return Err(TunnelError::Bind {
                source: last_error
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "bind")),
                flags,
            });
        };

        tracing::info!(address = %bind_addr, "listening for peer advertisements");
        let mut buf = [0u8; 1024];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!(error = %e, "reading from UDP failed");
                    continue;
                }
            };
            let SocketAddr::V6(src) = src else { continue };
            self.handle_datagram(local, *src.ip(), &buf[..n]).await;
        }
    }

    /// Processes one advertisement. Returns the update task when one was
    /// spawned, so callers (and tests) can observe completion.
    pub async fn handle_datagram(
        self: &Arc<Self>,
        local: Ipv6Addr,
        remote: Ipv6Addr,
        payload: &[u8],
    ) -> Option<JoinHandle<()>> {
        let pod_ip = String::from_utf8_lossy(payload).trim().to_string();
        if pod_ip.is_empty() {
            tracing::warn!(peer = %remote, "ignoring empty advertisement");
            return None;
        }

        let peer = {
            let mut peers = self.peers.lock().await;
            Arc::clone(peers.entry(remote).or_insert_with(|| {
                Arc::new(Peer {
                    local,
                    remote,
                    state: Mutex::new(PeerState::new(pod_ip.clone())),
                })
            }))
        };

        let now = Instant::now();
        let update_needed = {
            let mut state = peer.state.lock().await;
            state.last_seen = now;
            needs_update(&state, &pod_ip, now)
        };

        let task = if update_needed {
            let devices = Arc::clone(&self.devices);
            Some(tokio::spawn(async move {
                update_peer(devices, peer, pod_ip).await;
            }))
        } else {
            None
        };

        let clean_due = {
            let mut next_clean = self.next_clean.lock().await;
            if now >= *next_clean {
                *next_clean = now + CLEANUP_PERIOD;
                true
            } else {
                false
            }
        };
        if clean_due {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                controller.clean().await;
            });
        }

        task
    }

    /// Evicts peers that have not advertised within the expiration window and
    /// deletes their tunnel devices.
    pub async fn clean(&self) {
        self.clean_at(Instant::now()).await
    }

    async fn clean_at(&self, now: Instant) {
        let snapshot: Vec<(Ipv6Addr, Arc<Peer>)> = {
            let peers = self.peers.lock().await;
            peers.iter().map(|(k, v)| (*k, Arc::clone(v))).collect()
        };

        for (key, peer) in snapshot {
            let outdated = {
                let state = peer.state.lock().await;
                now.duration_since(state.last_seen) > EXPIRATION
            };
            if !outdated {
                continue;
            }
            self.peers.lock().await.remove(&key);
            let name = bond_tunnel_link_name(&peer.remote);
            tracing::info!(peer = %key, link = %name, "evicting idle peer");
            if let Err(e) = self.devices.delete_link(&name).await {
                tracing::error!(link = %name, error = %e, "failed to delete tunnel of evicted peer");
            }
        }
    }

    /// Readiness is a pure function of the peer map: at least one peer, and
    /// every peer fully materialised without a recorded error.
    pub async fn readiness(&self) -> Result<(), String> {
        let peers: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().await;
            peers.values().cloned().collect()
        };
        if peers.is_empty() {
            return Err("no tunnel peers registered".to_string());
        }
        for peer in peers {
            let state = peer.state.lock().await;
            if !state.creation_complete || state.last_error.is_some() {
                let reason = state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "tunnel creation pending".to_string());
                return Err(format!("peer {} not ready: {reason}", state.pod_ip));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    async fn peer(&self, remote: Ipv6Addr) -> Option<Arc<Peer>> {
        self.peers.lock().await.get(&remote).cloned()
    }

    #[cfg(test)]
    async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

/// Rebuilds the tunnel device and host route of one peer. Serialised by the
/// per-peer lock; failures are recorded on the peer and retried after the
/// backoff window.
async fn update_peer(devices: Arc<dyn TunnelDevices>, peer: Arc<Peer>, new_pod_ip: String) {
    let mut state = peer.state.lock().await;
    state.pod_ip = new_pod_ip;

    let name = bond_tunnel_link_name(&peer.remote);

    if let Err(e) = devices.delete_link(&name).await {
        state.set_failed(format!("failed to delete link {name}: {e}"), Instant::now());
        return;
    }

    if let Err(e) = devices.create_tunnel(&name, peer.local, peer.remote).await {
        state.set_failed(format!("failed to create tunnel {name}: {e}"), Instant::now());
        return;
    }
    tracing::info!(link = %name, "tunnel created");

    let route = match host_route(&state.pod_ip) {
        Ok(route) => route,
        Err(e) => {
            state.set_failed(e, Instant::now());
            return;
        }
    };
    if let Err(e) = devices.replace_host_route(route, &name).await {
        state.set_failed(format!("failed to replace route via {name}: {e}"), Instant::now());
        return;
    }

    state.creation_complete = true;
    state.last_error = None;
    state.last_creation_failed = None;
    state.creation_failed_count = 0;
}

/// The /32 or /128 host route toward an advertised pod IP.
fn host_route(pod_ip: &str) -> Result<IpNet, String> {
    let ip: IpAddr = pod_ip
        .parse()
        .map_err(|_| format!("failed to parse pod IP {pod_ip:?}"))?;
    let net = match ip {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::new(v4, 32).map_err(|e| e.to_string())?),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::new(v6, 128).map_err(|e| e.to_string())?),
    };
    Ok(net)
}

/// Sends the kube-apiserver pod IP to the tunnel controller of `peer`.
pub async fn send_advertisement(peer: Ipv6Addr, pod_ip: &str) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await?;
    socket
        .connect(SocketAddrV6::new(peer, TUNNEL_CONTROLLER_PORT, 0, 0))
        .await?;
    socket.send(pod_ip.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct FakeDevices {
        deleted: StdMutex<Vec<String>>,
        tunnels: StdMutex<Vec<(String, Ipv6Addr, Ipv6Addr)>>,
        routes: StdMutex<Vec<(IpNet, String)>>,
        fail_create: StdMutex<bool>,
    }

    #[async_trait]
    impl TunnelDevices for FakeDevices {
        async fn delete_link(&self, name: &str) -> NetworkResult<()> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn create_tunnel(
            &self,
            name: &str,
            local: Ipv6Addr,
            remote: Ipv6Addr,
        ) -> NetworkResult<()> {
            if *self.fail_create.lock().unwrap() {
                return Err(NetworkError::Command {
                    cmd: "ip -6 tunnel add".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            self.tunnels.lock().unwrap().push((name.to_string(), local, remote));
            Ok(())
        }

        async fn replace_host_route(&self, dst: IpNet, link_name: &str) -> NetworkResult<()> {
            self.routes.lock().unwrap().push((dst, link_name.to_string()));
            Ok(())
        }
    }

    fn local() -> Ipv6Addr {
        "fd8f:6d53:b97a:1::b:0".parse().unwrap()
    }

    fn seed_peer() -> Ipv6Addr {
        "fd8f:6d53:b97a:1::a47".parse().unwrap()
    }

    #[tokio::test]
    async fn advertisement_materialises_tunnel_and_route() {
        let devices = Arc::new(FakeDevices::default());
        let controller = TunnelController::new(Arc::clone(&devices) as _);

        let task = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.5")
            .await
            .expect("update should be spawned");
        task.await.unwrap();

        let tunnels = devices.tunnels.lock().unwrap().clone();
        assert_eq!(tunnels, vec![("bond0ip6tnl0a47".to_string(), local(), seed_peer())]);
        let routes = devices.routes.lock().unwrap().clone();
        assert_eq!(
            routes,
            vec![("10.0.0.5/32".parse().unwrap(), "bond0ip6tnl0a47".to_string())]
        );
        assert!(controller.readiness().await.is_ok());
    }

    #[tokio::test]
    async fn repeated_advertisement_does_not_update_again() {
        let devices = Arc::new(FakeDevices::default());
        let controller = TunnelController::new(Arc::clone(&devices) as _);

        let task = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.5")
            .await
            .unwrap();
        task.await.unwrap();

        let again = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.5")
            .await;
        assert!(again.is_none());
        assert_eq!(devices.tunnels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_pod_ip_triggers_a_rebuild() {
        let devices = Arc::new(FakeDevices::default());
        let controller = TunnelController::new(Arc::clone(&devices) as _);

        let task = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.5")
            .await
            .unwrap();
        task.await.unwrap();

        let task = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.6")
            .await
            .expect("pod ip change should rebuild");
        task.await.unwrap();

        let routes = devices.routes.lock().unwrap().clone();
        assert_eq!(routes.last().unwrap().0, "10.0.0.6/32".parse::<IpNet>().unwrap());
    }

    #[tokio::test]
    async fn ipv6_pod_ip_gets_a_128_route() {
        let devices = Arc::new(FakeDevices::default());
        let controller = TunnelController::new(Arc::clone(&devices) as _);

        let task = controller
            .handle_datagram(local(), seed_peer(), b"fd02::5")
            .await
            .unwrap();
        task.await.unwrap();

        let routes = devices.routes.lock().unwrap().clone();
        assert_eq!(routes[0].0, "fd02::5/128".parse::<IpNet>().unwrap());
    }

    #[tokio::test]
    async fn failed_creation_backs_off_and_reports_not_ready() {
        let devices = Arc::new(FakeDevices::default());
        *devices.fail_create.lock().unwrap() = true;
        let controller = TunnelController::new(Arc::clone(&devices) as _);

        let task = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.5")
            .await
            .unwrap();
        task.await.unwrap();

        let peer = controller.peer(seed_peer()).await.unwrap();
        {
            let state = peer.state.lock().await;
            assert!(!state.creation_complete);
            assert_eq!(state.creation_failed_count, 1);
            assert!(state.last_error.as_deref().unwrap().contains("bond0ip6tnl0a47"));
        }

        // Within the backoff window a repeated advertisement does nothing.
        let again = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.5")
            .await;
        assert!(again.is_none());

        let err = controller.readiness().await.unwrap_err();
        assert!(err.contains("10.0.0.5"), "{err}");
    }

    #[tokio::test]
    async fn needs_update_truth_table() {
        let now = Instant::now();
        let mut state = PeerState::new("10.0.0.5".to_string());

        // fresh peer: update
        assert!(needs_update(&state, "10.0.0.5", now));

        // complete peer with same pod ip: no update
        state.creation_complete = true;
        assert!(!needs_update(&state, "10.0.0.5", now));

        // pod ip change always updates
        assert!(needs_update(&state, "10.0.0.6", now));

        // failed within backoff: no update; after backoff: update
        state.creation_complete = false;
        state.last_creation_failed = Some(now);
        assert!(!needs_update(&state, "10.0.0.5", now + Duration::from_secs(5)));
        assert!(needs_update(&state, "10.0.0.5", now + Duration::from_secs(31)));
    }

    #[tokio::test]
    async fn idle_peers_are_evicted_with_their_tunnels() {
        let devices = Arc::new(FakeDevices::default());
        let controller = TunnelController::new(Arc::clone(&devices) as _);

        let task = controller
            .handle_datagram(local(), seed_peer(), b"10.0.0.5")
            .await
            .unwrap();
        task.await.unwrap();

        controller
            .clean_at(Instant::now() + EXPIRATION + Duration::from_secs(1))
            .await;

        assert_eq!(controller.peer_count().await, 0);
        assert!(devices
            .deleted
            .lock()
            .unwrap()
            .contains(&"bond0ip6tnl0a47".to_string()));
        assert!(controller.readiness().await.is_err());
    }

    #[tokio::test]
    async fn readiness_requires_at_least_one_peer() {
        let devices = Arc::new(FakeDevices::default());
        let controller = TunnelController::new(devices as _);
        let err = controller.readiness().await.unwrap_err();
        assert!(err.contains("no tunnel peers"));
    }
}
