//! iptables adapter with backend probing.
//!
//! The images ship both `iptables-legacy` and `iptables-nft`; which one can
//! talk to the kernel depends on the loaded modules. Both backends are
//! probed with `-L` and the first working one is selected; the binary name
//! is adjusted for IPv6. Rules are installed with append-unique semantics so
//! that racing OpenVPN hooks stay idempotent.

use tokio::process::Command;

use crate::network::cidr::IpFamily;
use crate::network::error::{NetworkError, NetworkResult};

const BACKEND_SUFFIXES: &[&str] = &["legacy", "nft"];

pub struct Iptables {
    path: String,
    family: IpFamily,
}

impl Iptables {
    /// Probes the available backends and returns a handle bound to the first
    /// one whose v4 and v6 binaries both answer `-L`.
    pub async fn new(family: IpFamily) -> NetworkResult<Self> {
        for suffix in BACKEND_SUFFIXES {
            let path = format!("/usr/sbin/iptables-{suffix}");
            if backend_works(&path).await {
                tracing::info!("using iptables backend {suffix}");
                return Ok(Self {
                    path: adjust_path(&path, family),
                    family,
                });
            }
        }
        Err(NetworkError::NoIptablesBackend)
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub async fn append(&self, table: &str, chain: &str, spec: &[&str]) -> NetworkResult<()> {
        self.run(table, &["-A", chain], spec).await
    }

    /// Appends the rule only when an identical rule is not already present.
    pub async fn append_unique(&self, table: &str, chain: &str, spec: &[&str]) -> NetworkResult<()> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        self.append(table, chain, spec).await
    }

    /// Deletes the rule; a rule that is not present is not an error.
    pub async fn delete_if_exists(&self, table: &str, chain: &str, spec: &[&str]) -> NetworkResult<()> {
        if !self.exists(table, chain, spec).await? {
            return Ok(());
        }
        self.run(table, &["-D", chain], spec).await
    }

    async fn exists(&self, table: &str, chain: &str, spec: &[&str]) -> NetworkResult<bool> {
        let mut args: Vec<&str> = vec!["-t", table, "-C", chain];
        args.extend_from_slice(spec);
        let output = Command::new(&self.path)
            .args(&args)
            .output()
            .await
            .map_err(NetworkError::Io)?;
        Ok(output.status.success())
    }

    async fn run(&self, table: &str, op: &[&str], spec: &[&str]) -> NetworkResult<()> {
        let mut args: Vec<&str> = vec!["-t", table];
        args.extend_from_slice(op);
        args.extend_from_slice(spec);
        let output = Command::new(&self.path)
            .args(&args)
            .output()
            .await
            .map_err(NetworkError::Io)?;
        if !output.status.success() {
            return Err(NetworkError::Command {
                cmd: format!("{} {}", self.path, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn adjust_path(path: &str, family: IpFamily) -> String {
    match family {
        IpFamily::Ipv4 => path.to_string(),
        IpFamily::Ipv6 => path.replace("iptables-", "ip6tables-"),
    }
}

async fn backend_works(path: &str) -> bool {
    // A backend is usable only if both address families answer.
    for candidate in [path.to_string(), adjust_path(path, IpFamily::Ipv6)] {
        let ok = Command::new(&candidate)
            .arg("-L")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !ok {
            return false;
        }
    }
    true
}
