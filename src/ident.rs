//! Connection identities.
//!
//! An [`Identifier`] turns a packet into the key of the state table. It must
//! be deterministic: packets of one session always map to equal identities,
//! and packets of different sessions never do.

use std::fmt;
use std::hash::Hash;
use std::net::Ipv4Addr;

use crate::buffer::Packet;
use crate::headers::{parse_tcp_ports, Ethernet, Ipv4, Udp, ETHERTYPE_IPV4, PROTO_TCP, PROTO_UDP};
use crate::Error;

/// Derives a connection identity from a packet.
pub trait Identifier<P: Packet>: Send + Sync {
    /// The state table key.
    type ConnectionId: Clone + Eq + Hash + fmt::Debug + Send;

    /// Identify a packet, or fail with [`Error::PacketNotIdentified`].
    fn identify(&self, pkt: &P) -> Result<Self::ConnectionId, Error>;
}

/// Identity from the IPv4 addresses, the transport ports and the IP protocol.
///
/// Works for UDP and TCP. Anything else is not identified.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ipv4FiveTuple;

/// Key produced by [`Ipv4FiveTuple`].
///
/// The tuple is taken as seen on the wire, so the two directions of a
/// session have mirrored keys. A client that opens a connection registers
/// the key of the packets it expects back, see [`FiveTuple::reversed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiveTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

impl FiveTuple {
    /// The key of the opposite direction.
    pub fn reversed(&self) -> FiveTuple {
        FiveTuple {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.proto
        )
    }
}

impl Ipv4FiveTuple {
    fn tuple(data: &[u8]) -> Option<FiveTuple> {
        let (rest, ethernet) = Ethernet::parse(data).ok()?;
        if ethernet.ethertype != ETHERTYPE_IPV4 {
            return None;
        }

        let (rest, ipv4) = Ipv4::parse(rest).ok()?;

        let (src_port, dst_port) = match ipv4.proto {
            PROTO_UDP => {
                let (_, udp) = Udp::parse(rest).ok()?;
                (udp.src_port, udp.dst_port)
            }
            PROTO_TCP => parse_tcp_ports(rest).ok()?.1,
            _ => return None,
        };

        Some(FiveTuple {
            src_ip: ipv4.src,
            dst_ip: ipv4.dst,
            src_port,
            dst_port,
            proto: ipv4.proto,
        })
    }
}

impl<P: Packet> Identifier<P> for Ipv4FiveTuple {
    type ConnectionId = FiveTuple;

    fn identify(&self, pkt: &P) -> Result<FiveTuple, Error> {
        Self::tuple(pkt.data()).ok_or_else(|| {
            trace!("Packet not identified, len: {}", pkt.data_len());
            Error::PacketNotIdentified
        })
    }
}
