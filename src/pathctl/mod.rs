//! Seed-side path controller.
//!
//! Every tick all shoot peers are probed in parallel and advertised the
//! kube-apiserver pod IP. A single healthy peer is elected primary; the
//! routes toward the shoot networks point at the tunnel device of that peer
//! and are swapped (route replace, never add) when the primary drops out of
//! the good set.

pub mod ping;

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::network::address::bond_tunnel_link_name;
use crate::network::cidr::{overlaps_any, Cidr};
use crate::network::netlink::NetlinkHandle;
use crate::network::netmap::shoot_networks_for_netmap;
use crate::tunnel;

pub use ping::{IcmpPinger, PingError, Pinger};

pub const TICK_INTERVAL: Duration = Duration::from_secs(2);
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);
pub const PING_RETRIES: u32 = 1;

pub type RouterError = Box<dyn std::error::Error + Send + Sync>;

/// Route installation capability toward an elected primary peer.
#[async_trait]
pub trait NetRouter: Send + Sync {
    async fn update_routing(&self, new_primary: Ipv6Addr) -> Result<(), RouterError>;
}

pub struct PathController {
    pinger: Arc<dyn Pinger>,
    router: Arc<dyn NetRouter>,
    kube_apiserver_pod_ip: String,
    good: Arc<Mutex<HashSet<Ipv6Addr>>>,
    primary: Option<Ipv6Addr>,
}

impl PathController {
    pub fn new(
        pinger: Arc<dyn Pinger>,
        router: Arc<dyn NetRouter>,
        kube_apiserver_pod_ip: String,
    ) -> Self {
        Self {
            pinger,
            router,
            kube_apiserver_pod_ip,
            good: Arc::new(Mutex::new(HashSet::new())),
            primary: None,
        }
    }

    /// Runs the tick loop until the surrounding task is cancelled.
    pub async fn run(&mut self, clients: Vec<Ipv6Addr>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick_once(&clients).await;
        }
    }

    pub async fn tick_once(&mut self, clients: &[Ipv6Addr]) {
        self.ping_all(clients).await;
        if let Err(e) = self.elect().await {
            // During creation the pool is legitimately empty for a while;
            // an election failure must not end the controller.
            tracing::error!(error = %e, "primary election failed");
        }
    }

    async fn ping_all(&self, clients: &[Ipv6Addr]) {
        let mut tasks = Vec::with_capacity(clients.len() * 2);
        for client in clients.iter().copied() {
            let pinger = Arc::clone(&self.pinger);
            let good = Arc::clone(&self.good);
            tasks.push(tokio::spawn(async move {
                match pinger.ping(client).await {
                    Ok(()) => {
                        good.lock().expect("good set lock").insert(client);
                    }
                    Err(_) => {
                        tracing::info!(ip = %client, "client not healthy, removing from pool");
                        good.lock().expect("good set lock").remove(&client);
                    }
                }
            }));

            // Advertise our pod IP so the other side can set up the back route.
            let pod_ip = self.kube_apiserver_pod_ip.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = tunnel::send_advertisement(client, &pod_ip).await {
                    tracing::info!(ip = %client, error = %e, "sending advertisement failed");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn elect(&mut self) -> Result<(), RouterError> {
        let current_is_good = match self.primary {
            Some(primary) => self.good.lock().expect("good set lock").contains(&primary),
            None => false,
        };
        if current_is_good {
            return Ok(());
        }

        let new_primary = self
            .good
            .lock()
            .expect("good set lock")
            .iter()
            .next()
            .copied()
            .ok_or("no more good ips in pool")?;
        self.router.update_routing(new_primary).await?;
        tracing::info!(old = ?self.primary, new = %new_primary, "switching primary shoot client");
        self.primary = Some(new_primary);
        Ok(())
    }
}

/// Router over the real kernel: routes for the shoot networks are replaced
/// onto the per-peer tunnel device, mapped through the netmap plan when the
/// seed pod network collides with shoot space.
pub struct NetlinkRouter {
    pub netlink: Arc<NetlinkHandle>,
    pub seed_pod_network: Cidr,
    pub shoot_pod_networks: Vec<Cidr>,
    pub shoot_service_networks: Vec<Cidr>,
    pub shoot_node_networks: Vec<Cidr>,
}

#[async_trait]
impl NetRouter for NetlinkRouter {
    async fn update_routing(&self, new_primary: Ipv6Addr) -> Result<(), RouterError> {
        let link_name = bond_tunnel_link_name(&new_primary);
        let link_index = self.netlink.link_index(&link_name).await?;

        let plans = shoot_networks_for_netmap(
            &self.shoot_pod_networks,
            &self.shoot_service_networks,
            &self.shoot_node_networks,
        )?;
        let all: Vec<Cidr> = self
            .shoot_pod_networks
            .iter()
            .chain(&self.shoot_service_networks)
            .chain(&self.shoot_node_networks)
            .copied()
            .collect();
        let overlap = overlaps_any(&self.seed_pod_network, &all);

        for networks in [
            &self.shoot_service_networks,
            &self.shoot_pod_networks,
            &self.shoot_node_networks,
        ] {
            for network in networks {
                let Some(net) = network.net() else { continue };
                let dst = match (overlap, network.as_ipv4()) {
                    (true, Some(v4)) => IpNet::V4(plans.mapped(v4).unwrap_or(v4)),
                    _ => net,
                };
                self.netlink.replace_route(dst, link_index).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePinger {
        healthy: Mutex<HashSet<Ipv6Addr>>,
    }

    #[async_trait]
    impl Pinger for FakePinger {
        async fn ping(&self, peer: Ipv6Addr) -> Result<(), PingError> {
            if self.healthy.lock().unwrap().contains(&peer) {
                Ok(())
            } else {
                Err(PingError::PayloadMismatch)
            }
        }
    }

    #[derive(Default)]
    struct RecordingRouter {
        calls: Mutex<Vec<Ipv6Addr>>,
    }

    #[async_trait]
    impl NetRouter for RecordingRouter {
        async fn update_routing(&self, new_primary: Ipv6Addr) -> Result<(), RouterError> {
            self.calls.lock().unwrap().push(new_primary);
            Ok(())
        }
    }

    fn peer(n: u8) -> Ipv6Addr {
        format!("fd8f:6d53:b97a:1::b:{n:x}").parse().unwrap()
    }

    #[tokio::test]
    async fn elects_healthy_peer_and_replaces_routes_once() {
        let pinger = Arc::new(FakePinger {
            healthy: Mutex::new(HashSet::from([peer(0)])),
        });
        let router = Arc::new(RecordingRouter::default());
        let mut controller = PathController::new(
            Arc::clone(&pinger) as _,
            Arc::clone(&router) as _,
            "10.0.0.5".to_string(),
        );

        let clients = vec![peer(0), peer(1)];
        for _ in 0..3 {
            controller.tick_once(&clients).await;
        }

        assert_eq!(controller.primary, Some(peer(0)));
        assert_eq!(*router.calls.lock().unwrap(), vec![peer(0)]);
    }

    #[tokio::test]
    async fn fails_over_when_primary_turns_unhealthy() {
        let pinger = Arc::new(FakePinger {
            healthy: Mutex::new(HashSet::from([peer(0)])),
        });
        let router = Arc::new(RecordingRouter::default());
        let mut controller = PathController::new(
            Arc::clone(&pinger) as _,
            Arc::clone(&router) as _,
            "10.0.0.5".to_string(),
        );

        let clients = vec![peer(0), peer(1)];
        controller.tick_once(&clients).await;
        assert_eq!(controller.primary, Some(peer(0)));

        *pinger.healthy.lock().unwrap() = HashSet::from([peer(1)]);
        controller.tick_once(&clients).await;

        assert_eq!(controller.primary, Some(peer(1)));
        assert_eq!(*router.calls.lock().unwrap(), vec![peer(0), peer(1)]);
    }

    #[tokio::test]
    async fn empty_pool_keeps_running_without_primary() {
        let pinger = Arc::new(FakePinger { healthy: Mutex::new(HashSet::new()) });
        let router = Arc::new(RecordingRouter::default());
        let mut controller =
            PathController::new(pinger as _, Arc::clone(&router) as _, "10.0.0.5".to_string());

        controller.tick_once(&[peer(0)]).await;
        assert_eq!(controller.primary, None);
        assert!(router.calls.lock().unwrap().is_empty());
    }
}
