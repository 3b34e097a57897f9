//! Shared constants for devices, ports and the reserved NAT mapping ranges.

/// Name of the bonding aggregate device used in the HA deployment.
pub const BOND_DEVICE: &str = "bond0";

/// Name of the tun device used by the non-HA deployment.
pub const TUNNEL_DEVICE: &str = "tun0";

/// UDP port the tunnel controller listens on for peer advertisements.
pub const TUNNEL_CONTROLLER_PORT: u16 = 5400;

/// Port of the readiness endpoints (tunnel controller and OpenVPN health).
pub const READINESS_PORT: u16 = 8080;

/// Common-name prefix of seed-side VPN clients in the OpenVPN status file.
pub const SEED_CLIENT_PREFIX: &str = "vpn-seed-client";

/// Common-name prefix of shoot-side VPN clients in the OpenVPN status file.
pub const SHOOT_CLIENT_PREFIX: &str = "vpn-shoot-client";

// Reserved destination ranges for the double-NAT netmap. All four are
// disjoint blocks inside the reserved 240.0.0.0/4 space; the planner never
// maps outside its assigned range.
pub const SEED_POD_NETWORK_MAPPED: &str = "241.0.0.0/8";
pub const SHOOT_NODE_NETWORK_MAPPED: &str = "242.0.0.0/8";
pub const SHOOT_SERVICE_NETWORK_MAPPED: &str = "243.0.0.0/8";
pub const SHOOT_POD_NETWORK_MAPPED: &str = "244.0.0.0/8";

/// Group id the seed-side proxy runs under; used by the owner match of the
/// seed NETMAP OUTPUT rules.
pub const ENVOY_VPN_GROUP_ID: u32 = 31415;

/// Non-root user id of the proxy in the non-HA seed server pod.
pub const ENVOY_NON_ROOT_USER_ID: u32 = 65534;
