//! Host networking: CIDR/address math, the netmap planner and the adapters
//! toward netlink and iptables.

pub mod address;
pub mod cidr;
pub mod error;
pub mod firewall;
pub mod iptables;
pub mod netlink;
pub mod netmap;

pub use error::{NetworkError, NetworkResult};
