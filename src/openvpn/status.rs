//! Line-oriented codec for the OpenVPN status file (versions 2.6 and 2.7).
//!
//! Each line is comma-separated with a leading tag. Unknown tags are a parse
//! error; `HEADER` content is carried opaquely, blank lines and `END` are
//! terminators. Parsed lines keep their raw variable fields so the file can
//! be re-emitted unchanged.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum StatusParseError {
    #[error("unknown line type: {0}")]
    UnknownTag(String),
    #[error("invalid {tag} line: {line}")]
    InvalidLine { tag: &'static str, line: String },
    #[error("cannot parse timestamp {0:?}")]
    Timestamp(String),
    #[error("{tag}: cannot parse real client address {address:?}")]
    RealAddress { tag: &'static str, address: String },
    #[error("{tag}: cannot parse virtual IPv6 address {address:?}")]
    VirtualAddress { tag: &'static str, address: String },
    #[error("reading status file failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub common_name: String,
    pub real_address: (IpAddr, u16),
    pub real_address_raw: String,
    pub virtual_address: String,
    pub virtual_ipv6_address: Option<std::net::Ipv6Addr>,
    pub virtual_ipv6_raw: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_since: NaiveDateTime,
    pub connected_since_epoch: String,
    pub username: String,
    pub client_id: String,
    pub peer_id: String,
    pub data_channel_cipher: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub virtual_address: String,
    pub common_name: String,
    pub real_address: (IpAddr, u16),
    pub real_address_raw: String,
    pub last_ref: NaiveDateTime,
    pub last_ref_epoch: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OpenVpnStatus {
    pub version: String,
    pub updated_at: Option<NaiveDateTime>,
    pub updated_at_raw: String,
    pub updated_at_epoch: Option<String>,
    pub clients: Vec<ClientInfo>,
    pub routing_table: Vec<RoutingEntry>,
    pub global_stats: Vec<(String, Option<String>)>,
    client_list_header: Option<String>,
    routing_table_header: Option<String>,
    saw_end: bool,
}

impl OpenVpnStatus {
    pub fn parse_file(path: &str) -> Result<Self, StatusParseError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    /// Re-emits the parsed fields in canonical order; parsing and emitting a
    /// canonical status file reproduces it byte for byte up to line
    /// terminators.
    pub fn emit(&self) -> String {
        let mut out = String::new();
        out.push_str("TITLE,");
        out.push_str(&self.version);
        out.push('\n');

        if !self.updated_at_raw.is_empty() {
            out.push_str("TIME,");
            out.push_str(&self.updated_at_raw);
            if let Some(epoch) = &self.updated_at_epoch {
                out.push(',');
                out.push_str(epoch);
            }
            out.push('\n');
        }

        if let Some(header) = &self.client_list_header {
            out.push_str(header);
            out.push('\n');
        }
        for client in &self.clients {
            out.push_str(&format!(
                "CLIENT_LIST,{},{},{},{},{},{},{},{},{},{},{},{}\n",
                client.common_name,
                client.real_address_raw,
                client.virtual_address,
                client.virtual_ipv6_raw,
                client.bytes_received,
                client.bytes_sent,
                client.connected_since.format(TIMESTAMP_FORMAT),
                client.connected_since_epoch,
                client.username,
                client.client_id,
                client.peer_id,
                client.data_channel_cipher,
            ));
        }

        if let Some(header) = &self.routing_table_header {
            out.push_str(header);
            out.push('\n');
        }
        for entry in &self.routing_table {
            out.push_str(&format!(
                "ROUTING_TABLE,{},{},{},{}",
                entry.virtual_address,
                entry.common_name,
                entry.real_address_raw,
                entry.last_ref.format(TIMESTAMP_FORMAT),
            ));
            if let Some(epoch) = &entry.last_ref_epoch {
                out.push(',');
                out.push_str(epoch);
            }
            out.push('\n');
        }

        for (key, value) in &self.global_stats {
            out.push_str("GLOBAL_STATS,");
            out.push_str(key);
            if let Some(value) = value {
                out.push(',');
                out.push_str(value);
            }
            out.push('\n');
        }

        if self.saw_end {
            out.push_str("END\n");
        }
        out
    }
}

impl std::str::FromStr for OpenVpnStatus {
    type Err = StatusParseError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut status = OpenVpnStatus::default();

        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            if line == "END" {
                status.saw_end = true;
                continue;
            }
            let parts: Vec<&str> = line.split(',').collect();

            match parts[0] {
                "TITLE" => status.version = parts[1..].join(","),
                "TIME" => {
                    if parts.len() < 2 {
                        return Err(StatusParseError::InvalidLine {
                            tag: "TIME",
                            line: line.to_string(),
                        });
                    }
                    status.updated_at = Some(parse_timestamp(parts[1])?);
                    status.updated_at_raw = parts[1].to_string();
                    status.updated_at_epoch = parts.get(2).map(|s| s.to_string());
                }
                "CLIENT_LIST" => status.clients.push(parse_client(line, &parts)?),
                "ROUTING_TABLE" => status.routing_table.push(parse_routing(line, &parts)?),
                "GLOBAL_STATS" => {
                    if parts.len() < 2 {
                        return Err(StatusParseError::InvalidLine {
                            tag: "GLOBAL_STATS",
                            line: line.to_string(),
                        });
                    }
                    let value = if parts.len() > 2 {
                        Some(parts[2..].join(","))
                    } else {
                        None
                    };
                    status.global_stats.push((parts[1].to_string(), value));
                }
                "HEADER" => match parts.get(1).copied() {
                    Some("CLIENT_LIST") => status.client_list_header = Some(line.to_string()),
                    Some("ROUTING_TABLE") => status.routing_table_header = Some(line.to_string()),
                    _ => {}
                },
                other => return Err(StatusParseError::UnknownTag(other.to_string())),
            }
        }

        Ok(status)
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, StatusParseError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|_| StatusParseError::Timestamp(raw.to_string()))
}

fn parse_client(line: &str, parts: &[&str]) -> Result<ClientInfo, StatusParseError> {
    if parts.len() < 13 {
        return Err(StatusParseError::InvalidLine {
            tag: "CLIENT_LIST",
            line: line.to_string(),
        });
    }
    let invalid = || StatusParseError::InvalidLine {
        tag: "CLIENT_LIST",
        line: line.to_string(),
    };

    let virtual_ipv6_address = if parts[4].is_empty() {
        None
    } else {
        Some(parts[4].parse().map_err(|_| StatusParseError::VirtualAddress {
            tag: "CLIENT_LIST",
            address: parts[4].to_string(),
        })?)
    };

    Ok(ClientInfo {
        common_name: parts[1].to_string(),
        real_address: parse_real_client_address(parts[2]).ok_or_else(|| {
            StatusParseError::RealAddress {
                tag: "CLIENT_LIST",
                address: parts[2].to_string(),
            }
        })?,
        real_address_raw: parts[2].to_string(),
        virtual_address: parts[3].to_string(),
        virtual_ipv6_address,
        virtual_ipv6_raw: parts[4].to_string(),
        bytes_received: parts[5].parse().map_err(|_| invalid())?,
        bytes_sent: parts[6].parse().map_err(|_| invalid())?,
        connected_since: parse_timestamp(parts[7])?,
        connected_since_epoch: parts[8].to_string(),
        username: parts[9].to_string(),
        client_id: parts[10].to_string(),
        peer_id: parts[11].to_string(),
        data_channel_cipher: parts[12].to_string(),
    })
}

fn parse_routing(line: &str, parts: &[&str]) -> Result<RoutingEntry, StatusParseError> {
    if parts.len() < 5 {
        return Err(StatusParseError::InvalidLine {
            tag: "ROUTING_TABLE",
            line: line.to_string(),
        });
    }
    Ok(RoutingEntry {
        virtual_address: parts[1].to_string(),
        common_name: parts[2].to_string(),
        real_address: parse_real_client_address(parts[3]).ok_or_else(|| {
            StatusParseError::RealAddress {
                tag: "ROUTING_TABLE",
                address: parts[3].to_string(),
            }
        })?,
        real_address_raw: parts[3].to_string(),
        last_ref: parse_timestamp(parts[4])?,
        last_ref_epoch: parts.get(5).map(|s| s.to_string()),
    })
}

/// Parses the real client address variants OpenVPN writes:
/// `host:port`, `[v6]:port`, plain v6 without port (2.6), each optionally
/// prefixed by `(udp|tcp)(4|6)?:`. The port is 0 when absent.
pub fn parse_real_client_address(raw: &str) -> Option<(IpAddr, u16)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?:(?:udp|tcp)(?:4|6)?:)?(\[?[0-9A-Fa-f:.]+\]?)?(?::(\d+))?$")
            .expect("static regex is valid")
    });

    let caps = re.captures(raw)?;
    let host = caps.get(1)?.as_str();

    if let Some(port) = caps.get(2) {
        let ip: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()?;
        return Some((ip, port.as_str().parse().ok()?));
    }

    // `host:port` for IPv4 survives in the host capture; plain IPv6 without
    // a port is the OpenVPN 2.6 edge case.
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some((addr.ip(), addr.port()));
    }
    host.parse::<IpAddr>().ok().map(|ip| (ip, 0))
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Non-HA server with a single connected shoot client (2.7 format).
    pub const NONHA_READY: &str = "\
TITLE,OpenVPN 2.7_git x86_64-pc-linux-gnu [SSL (OpenSSL)] [LZO] [LZ4] [EPOLL] [MH/PKTINFO] [AEAD] [DCO]
TIME,2024-09-10 14:39:16,1725979156
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Virtual IPv6 Address,Bytes Received,Bytes Sent,Connected Since,Connected Since (time_t),Username,Client ID,Peer ID,Data Channel Cipher
CLIENT_LIST,vpn-shoot-client,10.180.0.5:43125,,fd8f:6d53:b97a:1::1:2,10446,7963,2024-09-10 14:37:30,1725979050,UNDEF,1,1,AES-256-GCM
HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref,Last Ref (time_t)
ROUTING_TABLE,fd8f:6d53:b97a:1::1:2,vpn-shoot-client,10.180.0.5:43125,2024-09-10 14:39:10,1725979150
GLOBAL_STATS,Max bcast/mcast queue length,0
GLOBAL_STATS,dco_enabled,0
END
";

    /// HA server with one seed client and one shoot client (2.7 format with
    /// protocol-prefixed IPv6 real addresses).
    pub const HA_READY: &str = "\
TITLE,OpenVPN 2.7_git x86_64-pc-linux-gnu [SSL (OpenSSL)] [LZO] [LZ4] [EPOLL] [MH/PKTINFO] [AEAD] [DCO]
TIME,2024-09-10 14:39:16,1725979156
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Virtual IPv6 Address,Bytes Received,Bytes Sent,Connected Since,Connected Since (time_t),Username,Client ID,Peer ID,Data Channel Cipher
CLIENT_LIST,vpn-seed-client-0,udp6:[fd00:10:180::10]:54321,,fd8f:6d53:b97a:1::1:2,13405,13547,2024-09-10 14:37:27,1725979047,UNDEF,0,0,AES-256-GCM
CLIENT_LIST,vpn-shoot-client-0,10.180.0.5:43125,,fd8f:6d53:b97a:1::1:3,10446,7963,2024-09-10 14:37:30,1725979050,UNDEF,1,1,AES-256-GCM
HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref,Last Ref (time_t)
ROUTING_TABLE,fd8f:6d53:b97a:1::1:2,vpn-seed-client-0,udp6:[fd00:10:180::10]:54321,2024-09-10 14:39:10,1725979150
GLOBAL_STATS,Max bcast/mcast queue length,0
END
";

    /// OpenVPN 2.6 variant: IPv6 real address without a port.
    pub const V26_NO_PORT: &str = "\
TITLE,OpenVPN 2.6.12 x86_64-pc-linux-gnu [SSL (OpenSSL)] [LZO] [LZ4] [EPOLL] [MH/PKTINFO] [AEAD]
TIME,2024-09-10 14:39:16,1725979156
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Virtual IPv6 Address,Bytes Received,Bytes Sent,Connected Since,Connected Since (time_t),Username,Client ID,Peer ID,Data Channel Cipher
CLIENT_LIST,vpn-shoot-client,2001:db8::10,,fd8f:6d53:b97a:1::1:2,10446,7963,2024-09-10 14:37:30,1725979050,UNDEF,1,1,AES-256-GCM
END
";
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn parses_nonha_status() {
        let status: OpenVpnStatus = NONHA_READY.parse().unwrap();
        assert!(status.version.starts_with("OpenVPN 2.7"));
        assert_eq!(
            status.updated_at.unwrap(),
            NaiveDateTime::parse_from_str("2024-09-10 14:39:16", TIMESTAMP_FORMAT).unwrap()
        );
        assert_eq!(status.clients.len(), 1);
        let client = &status.clients[0];
        assert_eq!(client.common_name, "vpn-shoot-client");
        assert_eq!(client.real_address, ("10.180.0.5".parse().unwrap(), 43125));
        assert_eq!(client.bytes_received, 10446);
        assert_eq!(client.bytes_sent, 7963);
        assert_eq!(status.routing_table.len(), 1);
        assert_eq!(status.global_stats.len(), 2);
        assert_eq!(
            status.global_stats[0],
            ("Max bcast/mcast queue length".to_string(), Some("0".to_string()))
        );
    }

    #[test]
    fn real_address_variants() {
        for (raw, ip, port) in [
            ("10.180.0.5:43125", "10.180.0.5", 43125u16),
            ("[2001:db8::1]:1234", "2001:db8::1", 1234),
            ("2001:db8::1", "2001:db8::1", 0),
            ("udp6:[2001:db8::1]:1234", "2001:db8::1", 1234),
            ("tcp4:10.0.0.1:1194", "10.0.0.1", 1194),
            ("udp:10.0.0.1:1194", "10.0.0.1", 1194),
        ] {
            let (got_ip, got_port) = parse_real_client_address(raw).expect(raw);
            assert_eq!(got_ip, raw_ip(ip), "{raw}");
            assert_eq!(got_port, port, "{raw}");
        }
        assert!(parse_real_client_address("not an address").is_none());
    }

    fn raw_ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v26_address_without_port() {
        let status: OpenVpnStatus = V26_NO_PORT.parse().unwrap();
        assert_eq!(
            status.clients[0].real_address,
            ("2001:db8::10".parse().unwrap(), 0)
        );
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let err = "TITLE,x\nBOGUS,1,2\n".parse::<OpenVpnStatus>().unwrap_err();
        assert!(matches!(err, StatusParseError::UnknownTag(tag) if tag == "BOGUS"));
    }

    #[test]
    fn short_client_list_is_rejected() {
        let err = "CLIENT_LIST,a,b,c\n".parse::<OpenVpnStatus>().unwrap_err();
        assert!(matches!(err, StatusParseError::InvalidLine { tag: "CLIENT_LIST", .. }));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let err = "TIME,yesterday\n".parse::<OpenVpnStatus>().unwrap_err();
        assert!(matches!(err, StatusParseError::Timestamp(_)));
    }

    #[test]
    fn round_trip_reconstructs_the_file() {
        for fixture in [NONHA_READY, HA_READY, V26_NO_PORT] {
            let status: OpenVpnStatus = fixture.parse().unwrap();
            assert_eq!(status.emit(), fixture);
        }
    }
}
