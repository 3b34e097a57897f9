//! Two-phase broker for a unique bonding IP.
//!
//! Phase 1 announces a randomly picked free IP as `reserved` and waits for
//! the write to propagate; phase 2 re-reads the pool and, if nobody else
//! claims the same IP, records it as `used`. Simultaneous announcements are
//! resolved by a jittered retry, bounded at 30 attempts. This is sufficient
//! for a cohort of a few dozen peers and needs no central arbiter.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv6Net;
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;

use crate::network::address::{bonding_seed_client_range, SeedClientRange};

use super::{IpPoolManager, PoolUsage, StoreError};

const MAX_ATTEMPTS: usize = 30;
const MAX_CANDIDATE_TRIES: usize = 1000;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("existing IP address lookup failed: {0}")]
    LookupFailed(StoreError),
    #[error("reserving IP address failed: {0}")]
    ReservationFailed(StoreError),
    #[error("using IP address failed: {0}")]
    UseFailed(StoreError),
    #[error("cannot find any free IP address")]
    NoFreeIp,
    #[error("invalid index range: start={start}, end={end}")]
    InvalidRange { start: u16, end: u16 },
    #[error("stored IP {0:?} is not a valid IPv6 address")]
    InvalidStoredIp(String),
    #[error("internal error: own ip undefined")]
    OwnIpUndefined,
}

pub struct IpAddressBroker {
    manager: Arc<dyn IpPoolManager>,
    range: SeedClientRange,
    own_name: String,
    wait_time: Duration,
    own_ip: Option<String>,
}

impl IpAddressBroker {
    pub fn new(
        manager: Arc<dyn IpPoolManager>,
        vpn_network: &Ipv6Net,
        own_name: &str,
        wait_time: Duration,
    ) -> Result<Self, BrokerError> {
        let range = bonding_seed_client_range(vpn_network);
        check_range(range.start, range.end)?;
        Ok(Self {
            manager,
            range,
            own_name: own_name.to_string(),
            wait_time,
            own_ip: None,
        })
    }

    /// Overwrites the default start and end index (inclusive).
    pub fn set_index_range(&mut self, start: u16, end: u16) -> Result<(), BrokerError> {
        check_range(start, end)?;
        self.range.start = start;
        self.range.end = end;
        Ok(())
    }

    /// Acquires a bonding IP that no other pod uses or reserves.
    ///
    /// Idempotent: a caller whose `used` record already exists gets it back
    /// immediately. On success the returned IP has been persisted as used.
    pub async fn acquire(&mut self) -> Result<Ipv6Addr, BrokerError> {
        let mut last_lookup: Option<PoolUsage> = None;

        for _ in 0..MAX_ATTEMPTS {
            let lookup = self
                .manager
                .usage_lookup(&self.own_name)
                .await
                .map_err(BrokerError::LookupFailed)?;
            if lookup.own_used {
                let ip = lookup.own_ip.ok_or(BrokerError::OwnIpUndefined)?;
                return parse_ip(ip);
            }

            self.announce(false, &lookup).await?;
            tracing::info!(name = %self.own_name, ip = ?self.own_ip, "reserving bonding ip");
            sleep(self.wait_time).await;

            let lookup = self
                .manager
                .usage_lookup(&self.own_name)
                .await
                .map_err(BrokerError::LookupFailed)?;
            let conflict = self.has_conflict(&lookup);
            last_lookup = Some(lookup);
            if !conflict {
                break;
            }

            tracing::info!(name = %self.own_name, "bonding ip conflict, retrying");
            let jitter = rand::thread_rng().gen::<f64>();
            sleep(self.wait_time.mul_f64(jitter)).await;
        }

        let lookup = last_lookup.ok_or(BrokerError::NoFreeIp)?;
        if self.has_conflict(&lookup) {
            return Err(BrokerError::NoFreeIp);
        }

        self.announce(true, &lookup).await?;
        let ip = self.own_ip.clone().ok_or(BrokerError::OwnIpUndefined)?;
        tracing::info!(name = %self.own_name, %ip, "using bonding ip");
        parse_ip(ip)
    }

    async fn announce(&mut self, used: bool, lookup: &PoolUsage) -> Result<(), BrokerError> {
        if lookup.own_used {
            return Ok(());
        }
        let ip = if used {
            lookup.own_ip.clone().ok_or(BrokerError::OwnIpUndefined)?
        } else {
            self.find_free_ip(lookup).ok_or(BrokerError::NoFreeIp)?
        };
        self.manager
            .set_ip_address(&self.own_name, &ip, used)
            .await
            .map_err(if used {
                BrokerError::UseFailed
            } else {
                BrokerError::ReservationFailed
            })?;
        self.own_ip = Some(ip);
        Ok(())
    }

    fn find_free_ip(&self, lookup: &PoolUsage) -> Option<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CANDIDATE_TRIES {
            let index = rng.gen_range(self.range.start..=self.range.end);
            let ip = self.range.ip_for_index(index).to_string();
            if lookup.foreign_used.contains(&ip) || lookup.foreign_reserved.contains(&ip) {
                continue;
            }
            return Some(ip);
        }
        None
    }

    fn has_conflict(&self, lookup: &PoolUsage) -> bool {
        match &self.own_ip {
            Some(ip) => lookup.foreign_used.contains(ip) || lookup.foreign_reserved.contains(ip),
            None => false,
        }
    }
}

fn check_range(start: u16, end: u16) -> Result<(), BrokerError> {
    if start == 0 || end <= start {
        return Err(BrokerError::InvalidRange { start, end });
    }
    Ok(())
}

fn parse_ip(ip: String) -> Result<Ipv6Addr, BrokerError> {
    ip.parse().map_err(|_| BrokerError::InvalidStoredIp(ip))
}
