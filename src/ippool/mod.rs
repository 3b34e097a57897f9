//! Cooperative, leaderless allocation of seed-side bonding IPs.
//!
//! Every seed client pod runs one broker against a shared pool (the seed
//! range of the VPN network). Pool state lives in pod annotations; there is
//! no central allocator. See [`broker`] for the announce/verify protocol.

pub mod broker;
pub mod pod_store;

use std::collections::HashSet;

use async_trait::async_trait;

pub use broker::{BrokerError, IpAddressBroker};
pub use pod_store::PodAnnotationStore;

/// Errors of a storage backend. Backends differ (Kubernetes API, in-memory
/// fake), so the broker only needs something displayable.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Snapshot of the pool as seen through the storage at one point in time.
#[derive(Debug, Clone, Default)]
pub struct PoolUsage {
    /// The caller's recorded IP, if any.
    pub own_ip: Option<String>,
    /// Whether the caller's IP is recorded as used (vs merely reserved).
    pub own_used: bool,
    /// IPs other pods record as used.
    pub foreign_used: HashSet<String>,
    /// IPs other pods record as reserved.
    pub foreign_reserved: HashSet<String>,
}

/// Storage capability of the broker: a lookup of current pool usage and a
/// write of the caller's reservation or use.
#[async_trait]
pub trait IpPoolManager: Send + Sync {
    async fn usage_lookup(&self, own_name: &str) -> Result<PoolUsage, StoreError>;
    async fn set_ip_address(&self, own_name: &str, ip: &str, used: bool) -> Result<(), StoreError>;
}
