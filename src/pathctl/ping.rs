//! ICMPv6 liveness probe for the bonding peers.
//!
//! Echo requests go through an ICMPv6 datagram socket with a process-wide
//! sequence counter and a fixed literal payload; a reply only counts when
//! both match. After the first failed attempt a neighbor solicitation is
//! fired at the solicited-node multicast group of the target to warm the
//! neighbour cache before the retry (RFC 4861 §7.1.1: multicast hop limit
//! must be 255 or the solicitation is dropped).

use std::io::{self, Read};
use std::mem::MaybeUninit;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

use crate::constants::BOND_DEVICE;

const ECHO_PAYLOAD: &[u8] = b"HELLO-R-U-THERE";

const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV6_NEIGHBOR_SOLICITATION: u8 = 135;
const ICMPV6_NEIGHBOR_ADVERTISEMENT: u8 = 136;

#[derive(Debug, Error)]
pub enum PingError {
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("unexpected ICMPv6 message type {0}")]
    UnexpectedType(u8),
    #[error("unexpected sequence number: {got} != {want}")]
    SequenceMismatch { got: u16, want: u16 },
    #[error("payload mismatch")]
    PayloadMismatch,
    #[error("short ICMPv6 reply ({0} bytes)")]
    ShortReply(usize),
    #[error("bonding device has no usable hardware address: {0}")]
    HardwareAddress(String),
    #[error("probe task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Liveness probe capability; the path controller takes any implementation.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, peer: Ipv6Addr) -> Result<(), PingError>;
}

pub struct IcmpPinger {
    timeout: Duration,
    retries: u32,
    last_seq: AtomicU16,
}

impl IcmpPinger {
    pub fn new(timeout: Duration, retries: u32) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            retries,
            last_seq: AtomicU16::new(0),
        })
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, peer: Ipv6Addr) -> Result<(), PingError> {
        let mut last = None;
        for attempt in 0..=self.retries {
            let seq = self.last_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let timeout = self.timeout;
            let started = Instant::now();
            let result = tokio::task::spawn_blocking(move || ping_once(peer, seq, timeout)).await?;

            let elapsed = started.elapsed();
            match &result {
                Ok(()) => {
                    if elapsed > Duration::from_millis(100) {
                        tracing::info!(ip = %peer, ?elapsed, "ping took more than 100ms");
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::info!(ip = %peer, ?elapsed, error = %e, "ping failed");
                    if attempt == 0 {
                        let timeout = self.timeout / 2;
                        tokio::spawn(async move {
                            tracing::info!(ip = %peer, "sending neighbor solicitation");
                            let outcome = tokio::task::spawn_blocking(move || {
                                neighbor_solicitation(peer, timeout)
                            })
                            .await;
                            match outcome {
                                Ok(Ok(())) => {
                                    tracing::info!(ip = %peer, "received neighbor advertisement")
                                }
                                Ok(Err(e)) => {
                                    tracing::info!(ip = %peer, error = %e, "neighbor solicitation failed")
                                }
                                Err(e) => {
                                    tracing::info!(ip = %peer, error = %e, "neighbor solicitation task failed")
                                }
                            }
                        });
                    }
                }
            }
            last = Some(result);
        }
        last.unwrap_or(Ok(()))
    }
}

fn ping_once(peer: Ipv6Addr, seq: u16, timeout: Duration) -> Result<(), PingError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6))?;
    socket.set_read_timeout(Some(timeout))?;

    let id = (std::process::id() & 0xffff) as u16;
    let mut msg = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    msg.extend_from_slice(&[ICMPV6_ECHO_REQUEST, 0, 0, 0]);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(ECHO_PAYLOAD);

    let target = SockAddr::from(SocketAddrV6::new(peer, 0, 0, 0));
    socket.send_to(&msg, &target)?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    let n = socket.recv(&mut buf)?;
    let reply = received_bytes(&buf, n);

    if reply.len() < 8 {
        return Err(PingError::ShortReply(reply.len()));
    }
    if reply[0] != ICMPV6_ECHO_REPLY {
        return Err(PingError::UnexpectedType(reply[0]));
    }
    let got_seq = u16::from_be_bytes([reply[6], reply[7]]);
    if got_seq != seq {
        return Err(PingError::SequenceMismatch { got: got_seq, want: seq });
    }
    if &reply[8..] != ECHO_PAYLOAD {
        return Err(PingError::PayloadMismatch);
    }
    Ok(())
}

fn neighbor_solicitation(target: Ipv6Addr, timeout: Duration) -> Result<(), PingError> {
    let ifindex = nix::net::if_::if_nametoindex(BOND_DEVICE)
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
    let hw_addr = read_hardware_address(BOND_DEVICE)?;

    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_multicast_if_v6(ifindex)?;
    // Hop limit 255 guarantees the packet is dropped if it was routed.
    socket.set_multicast_hops_v6(255)?;

    // type, code, checksum (kernel-computed), reserved, target, SLLA option
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(&[ICMPV6_NEIGHBOR_SOLICITATION, 0, 0, 0]);
    msg.extend_from_slice(&[0, 0, 0, 0]);
    msg.extend_from_slice(&target.octets());
    msg.extend_from_slice(&[1, 1]);
    msg.extend_from_slice(&hw_addr);

    let dst = SockAddr::from(SocketAddrV6::new(
        solicited_node_multicast(&target),
        0,
        0,
        ifindex,
    ));
    socket.send_to(&msg, &dst)?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    let n = socket.recv(&mut buf)?;
    let reply = received_bytes(&buf, n);
    if reply.first() == Some(&ICMPV6_NEIGHBOR_ADVERTISEMENT) {
        Ok(())
    } else {
        Err(PingError::UnexpectedType(reply.first().copied().unwrap_or(0)))
    }
}

/// The solicited-node multicast address of `target`: `ff02::1:ff00:0` with
/// the low 24 bits of the target copied in.
fn solicited_node_multicast(target: &Ipv6Addr) -> Ipv6Addr {
    let mut octets = "ff02::1:ff00:0"
        .parse::<Ipv6Addr>()
        .expect("static address is valid")
        .octets();
    octets[13..16].copy_from_slice(&target.octets()[13..16]);
    Ipv6Addr::from(octets)
}

fn read_hardware_address(device: &str) -> Result<[u8; 6], PingError> {
    let mut raw = String::new();
    std::fs::File::open(format!("/sys/class/net/{device}/address"))?.read_to_string(&mut raw)?;
    parse_hardware_address(raw.trim())
}

fn parse_hardware_address(raw: &str) -> Result<[u8; 6], PingError> {
    let mut mac = [0u8; 6];
    let mut parts = raw.split(':');
    for byte in &mut mac {
        let part = parts
            .next()
            .ok_or_else(|| PingError::HardwareAddress(raw.to_string()))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| PingError::HardwareAddress(raw.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(PingError::HardwareAddress(raw.to_string()));
    }
    Ok(mac)
}

fn received_bytes(buf: &[MaybeUninit<u8>], n: usize) -> &[u8] {
    // The kernel initialised the first n bytes of the buffer.
    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), n) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solicited_node_multicast_takes_low_24_bits() {
        let target: Ipv6Addr = "fd8f:6d53:b97a:1::b:1".parse().unwrap();
        assert_eq!(
            solicited_node_multicast(&target),
            "ff02::1:ff0b:1".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn echo_payload_is_15_octets() {
        assert_eq!(ECHO_PAYLOAD.len(), 15);
    }

    #[test]
    fn hardware_address_parsing() {
        assert_eq!(
            parse_hardware_address("aa:bb:cc:dd:ee:ff").unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
        assert!(parse_hardware_address("aa:bb:cc").is_err());
        assert!(parse_hardware_address("aa:bb:cc:dd:ee:ff:00").is_err());
        assert!(parse_hardware_address("zz:bb:cc:dd:ee:ff").is_err());
    }
}
