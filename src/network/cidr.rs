//! CIDR value type shared by configuration, routing and the NAT planner.
//!
//! A [`Cidr`] is an IP prefix (address + prefix length). The empty value is a
//! legal "unset" sentinel whose string form is the empty string; it shows up
//! for optional networks such as the shoot node network.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid CIDR {0:?}")]
pub struct CidrParseError(pub String);

/// IP address family of a prefix or configuration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum IpFamily {
    Ipv4,
    Ipv6,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::Ipv4 => "IPv4",
            IpFamily::Ipv6 => "IPv6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpFamily {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IPv4" => Ok(IpFamily::Ipv4),
            "IPv6" => Ok(IpFamily::Ipv6),
            other => Err(CidrParseError(other.to_string())),
        }
    }
}

/// An IP prefix, possibly empty. Equality is address + mask equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cidr(Option<IpNet>);

impl Cidr {
    pub fn new(net: IpNet) -> Self {
        Cidr(Some(net.trunc()))
    }

    pub fn empty() -> Self {
        Cidr(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn net(&self) -> Option<IpNet> {
        self.0
    }

    pub fn family(&self) -> Option<IpFamily> {
        match self.0 {
            Some(IpNet::V4(_)) => Some(IpFamily::Ipv4),
            Some(IpNet::V6(_)) => Some(IpFamily::Ipv6),
            None => None,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.0, Some(IpNet::V4(_)))
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Net> {
        match self.0 {
            Some(IpNet::V4(net)) => Some(net),
            _ => None,
        }
    }

    pub fn as_ipv6(&self) -> Option<Ipv6Net> {
        match self.0 {
            Some(IpNet::V6(net)) => Some(net),
            _ => None,
        }
    }

    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        self.0.map(|net| net.contains(ip)).unwrap_or(false)
    }

    /// Whether the two prefixes share any address. Empty prefixes overlap
    /// nothing.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        match (self.0, other.0) {
            (Some(a), Some(b)) => {
                a.contains(&b.network()) || b.contains(&a.network())
            }
            _ => false,
        }
    }
}

impl From<IpNet> for Cidr {
    fn from(net: IpNet) -> Self {
        Cidr::new(net)
    }
}

impl From<Ipv4Net> for Cidr {
    fn from(net: Ipv4Net) -> Self {
        Cidr::new(IpNet::V4(net))
    }
}

impl From<Ipv6Net> for Cidr {
    fn from(net: Ipv6Net) -> Self {
        Cidr::new(IpNet::V6(net))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(net) => write!(f, "{net}"),
            None => Ok(()),
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Cidr::empty());
        }
        s.parse::<IpNet>()
            .map(Cidr::new)
            .map_err(|_| CidrParseError(s.to_string()))
    }
}

/// Parses a comma-separated CIDR list. Empty input yields an empty list.
pub fn parse_cidr_list(value: &str) -> Result<Vec<Cidr>, CidrParseError> {
    let mut cidrs = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        cidrs.push(part.parse()?);
    }
    Ok(cidrs)
}

/// Filters a CIDR list down to the members of one family.
pub fn by_family(cidrs: &[Cidr], family: IpFamily) -> Vec<Cidr> {
    cidrs
        .iter()
        .copied()
        .filter(|c| c.family() == Some(family))
        .collect()
}

/// Whether `cidr` overlaps any of the given prefixes.
pub fn overlaps_any<'a>(cidr: &Cidr, others: impl IntoIterator<Item = &'a Cidr>) -> bool {
    others.into_iter().any(|other| cidr.overlaps(other))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_cidr_round_trips_as_empty_string() {
        let c = cidr("");
        assert!(c.is_empty());
        assert_eq!(c.to_string(), "");
    }

    #[test]
    fn parse_normalises_host_bits() {
        assert_eq!(cidr("10.1.2.3/16").to_string(), "10.1.0.0/16");
    }

    #[test]
    fn equality_is_address_and_mask() {
        assert_eq!(cidr("10.0.0.0/16"), cidr("10.0.0.0/16"));
        assert_ne!(cidr("10.0.0.0/16"), cidr("10.0.0.0/24"));
        assert_ne!(cidr("10.0.0.0/16"), cidr("10.1.0.0/16"));
    }

    #[test]
    fn family_classification() {
        assert_eq!(cidr("10.0.0.0/8").family(), Some(IpFamily::Ipv4));
        assert_eq!(cidr("fd00::/64").family(), Some(IpFamily::Ipv6));
        assert_eq!(Cidr::empty().family(), None);

        let list = [cidr("10.0.0.0/8"), cidr("fd00::/64"), cidr("192.168.0.0/16")];
        assert_eq!(by_family(&list, IpFamily::Ipv4).len(), 2);
        assert_eq!(by_family(&list, IpFamily::Ipv6).len(), 1);
    }

    #[test]
    fn overlap_detection() {
        assert!(cidr("10.0.0.0/8").overlaps(&cidr("10.1.0.0/16")));
        assert!(cidr("10.1.0.0/16").overlaps(&cidr("10.0.0.0/8")));
        assert!(!cidr("10.0.0.0/16").overlaps(&cidr("10.1.0.0/16")));
        assert!(!cidr("10.0.0.0/8").overlaps(&cidr("fd00::/64")));
        assert!(!Cidr::empty().overlaps(&cidr("10.0.0.0/8")));

        let nets = [cidr("100.64.0.0/13"), cidr("10.0.0.0/24")];
        assert!(overlaps_any(&cidr("10.0.0.0/16"), &nets));
        assert!(!overlaps_any(&cidr("172.16.0.0/12"), &nets));
    }

    #[test]
    fn list_parsing() {
        let list = parse_cidr_list("10.0.0.0/16, 100.64.0.0/13").unwrap();
        assert_eq!(list, vec![cidr("10.0.0.0/16"), cidr("100.64.0.0/13")]);
        assert!(parse_cidr_list("").unwrap().is_empty());
        assert!(parse_cidr_list("not-a-cidr").is_err());
    }
}
