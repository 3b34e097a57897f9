//! OpenVPN up/down hook.
//!
//! OpenVPN invokes this once the VPN device exists (`up`) and again when it
//! goes away (`down`). Up installs the INPUT-chain lockdown and the shoot
//! network routes over the device; down removes exactly the rules up
//! installed. Both directions are idempotent against hook re-runs.

use clap::ValueEnum;

use crate::network::cidr::{Cidr, IpFamily};
use crate::network::firewall::{icmpv6_accept_spec, input_chain_specs};
use crate::network::iptables::Iptables;
use crate::network::netlink::NetlinkHandle;

use super::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HookMode {
    Up,
    Down,
}

pub async fn run(device: String, mode: HookMode, shoot_networks: Vec<Cidr>) -> Result<(), CommandError> {
    // OpenVPN does not propagate PATH to its script hooks.
    std::env::set_var("PATH", "/sbin:/usr/sbin:/bin:/usr/bin");

    let ipt4 = Iptables::new(IpFamily::Ipv4).await?;
    let ipt6 = Iptables::new(IpFamily::Ipv6).await?;

    let mut specs = input_chain_specs(&device);
    specs.insert(0, icmpv6_accept_spec(&device));
    for (index, spec) in specs.iter().enumerate() {
        let spec: Vec<&str> = spec.iter().map(String::as_str).collect();
        let v6_only = index == 0;
        match mode {
            HookMode::Up => {
                if !v6_only {
                    ipt4.append_unique("filter", "INPUT", &spec).await?;
                }
                ipt6.append_unique("filter", "INPUT", &spec).await?;
            }
            HookMode::Down => {
                if !v6_only {
                    ipt4.delete_if_exists("filter", "INPUT", &spec).await?;
                }
                ipt6.delete_if_exists("filter", "INPUT", &spec).await?;
            }
        }
        tracing::info!(device = %device, ?mode, rule = ?spec, "applied INPUT rule");
    }

    if mode == HookMode::Up && !shoot_networks.is_empty() {
        let netlink = NetlinkHandle::new()?;
        for network in shoot_networks {
            let Some(net) = network.net() else { continue };
            netlink.replace_route_via(net, &device).await?;
        }
    }
    Ok(())
}
