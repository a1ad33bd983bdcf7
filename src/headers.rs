//! Ethernet, IPv4, UDP and the start of TCP.
//!
//! Just enough framing for the example protocols and for the 5-tuple
//! identifier. No IPv4 options are written, no fragmentation, no VLAN tags.

use std::net::Ipv4Addr;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;

use crate::buffer::Packet;
use crate::Error;

pub const ETHERNET_LEN: usize = 14;
pub const IPV4_LEN: usize = 20;
pub const UDP_LEN: usize = 8;

/// Offset of the UDP payload in a frame without IPv4 options.
pub const UDP_PAYLOAD_OFFSET: usize = ETHERNET_LEN + IPV4_LEN + UDP_LEN;

pub const ETHERTYPE_IPV4: u16 = 0x0800;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ethernet {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
}

impl Ethernet {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Ethernet> {
        let (input, dst) = take(6_usize)(input)?;
        let (input, src) = take(6_usize)(input)?;
        let (input, ethertype) = be_u16(input)?;

        let mut e = Ethernet {
            dst: [0; 6],
            src: [0; 6],
            ethertype,
        };
        e.dst.copy_from_slice(dst);
        e.src.copy_from_slice(src);

        Ok((input, e))
    }

    /// Write into the first [`ETHERNET_LEN`] bytes of `out`.
    pub fn serialize(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.dst);
        out[6..12].copy_from_slice(&self.src);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4 {
    /// Header length in 32 bit words.
    pub ihl: u8,
    pub total_length: u16,
    pub ttl: u8,
    pub proto: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4 {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Ipv4> {
        let (input, version_ihl) = be_u8(input)?;
        let (input, _tos) = be_u8(input)?;
        let (input, total_length) = be_u16(input)?;
        let (input, _identification) = be_u16(input)?;
        let (input, _flags_fragment) = be_u16(input)?;
        let (input, ttl) = be_u8(input)?;
        let (input, proto) = be_u8(input)?;
        let (input, checksum) = be_u16(input)?;
        let (input, src) = be_u32(input)?;
        let (input, dst) = be_u32(input)?;

        let ihl = version_ihl & 0x0f;
        if version_ihl >> 4 != 4 || ihl < 5 {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )));
        }

        // Skip options
        let (input, _) = take((ihl as usize - 5) * 4)(input)?;

        Ok((
            input,
            Ipv4 {
                ihl,
                total_length,
                ttl,
                proto,
                checksum,
                src: Ipv4Addr::from(src),
                dst: Ipv4Addr::from(dst),
            },
        ))
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Length of the IPv4 payload according to the header.
    pub fn payload_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(self.header_len())
    }

    /// Write a 20 byte header (no options) including the header checksum.
    pub fn serialize(&self, out: &mut [u8]) {
        let out = &mut out[..IPV4_LEN];
        out[0] = 0x45;
        out[1] = 0;
        out[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        out[4..8].fill(0);
        out[8] = self.ttl;
        out[9] = self.proto;
        out[10..12].fill(0);
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());

        let checksum = checksum(out);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// The ones' complement header checksum.
pub fn checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = match chunk {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => u16::from_be_bytes([*a, 0]),
            _ => 0,
        };
        sum += word as u32;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Udp {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload.
    pub length: u16,
    pub checksum: u16,
}

impl Udp {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Udp> {
        let (input, src_port) = be_u16(input)?;
        let (input, dst_port) = be_u16(input)?;
        let (input, length) = be_u16(input)?;
        let (input, checksum) = be_u16(input)?;

        Ok((
            input,
            Udp {
                src_port,
                dst_port,
                length,
                checksum,
            },
        ))
    }

    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(UDP_LEN)
    }

    pub fn serialize(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
    }
}

/// TCP ports. The rest of the TCP header is not needed here.
pub fn parse_tcp_ports(input: &[u8]) -> IResult<&[u8], (u16, u16)> {
    let (input, src_port) = be_u16(input)?;
    let (input, dst_port) = be_u16(input)?;
    Ok((input, (src_port, dst_port)))
}

/// A parsed Ethernet/IPv4/UDP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpFrame {
    pub ethernet: Ethernet,
    pub ipv4: Ipv4,
    pub udp: Udp,
    /// Offset of the UDP payload within the frame.
    pub payload_offset: usize,
}

impl UdpFrame {
    pub fn parse(data: &[u8]) -> Result<UdpFrame, Error> {
        let (rest, ethernet) = Ethernet::parse(data)?;
        if ethernet.ethertype != ETHERTYPE_IPV4 {
            return Err(Error::Parse(format!(
                "Not IPv4, ethertype: {:#06x}",
                ethernet.ethertype
            )));
        }

        let (rest, ipv4) = Ipv4::parse(rest)?;
        if ipv4.proto != PROTO_UDP {
            return Err(Error::Parse(format!("Not UDP, proto: {}", ipv4.proto)));
        }

        let (rest, udp) = Udp::parse(rest)?;
        let payload_offset = data.len() - rest.len();

        if rest.len() < udp.payload_len() {
            return Err(Error::Parse(format!(
                "Truncated UDP payload: {} < {}",
                rest.len(),
                udp.payload_len()
            )));
        }

        Ok(UdpFrame {
            ethernet,
            ipv4,
            udp,
            payload_offset,
        })
    }

    /// The UDP payload inside `data`, the frame this was parsed from.
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.payload_offset..self.payload_offset + self.udp.payload_len()]
    }

    /// The frame with source and destination swapped on every layer.
    pub fn reflected(&self) -> FrameBuilder {
        FrameBuilder {
            src_mac: self.ethernet.dst,
            dst_mac: self.ethernet.src,
            src_ip: self.ipv4.dst,
            dst_ip: self.ipv4.src,
            src_port: self.udp.dst_port,
            dst_port: self.udp.src_port,
        }
    }
}

/// Addressing for writing Ethernet/IPv4/UDP frames into packet buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBuilder {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FrameBuilder {
    /// Write a complete frame carrying `payload` into `pkt`.
    pub fn write<P: Packet>(&self, pkt: &mut P, payload: &[u8]) -> Result<(), Error> {
        self.write_with(pkt, payload.len(), |out| out.copy_from_slice(payload))
    }

    /// Write a frame with a `payload_len` byte payload filled in by `fill`.
    pub fn write_with<P, F>(&self, pkt: &mut P, payload_len: usize, fill: F) -> Result<(), Error>
    where
        P: Packet,
        F: FnOnce(&mut [u8]),
    {
        let total = UDP_PAYLOAD_OFFSET + payload_len;
        if total > u16::MAX as usize {
            return Err(Error::BufferTooSmall {
                need: total,
                have: u16::MAX as usize,
            });
        }
        pkt.set_data_len(total)?;

        let data = pkt.data_mut();

        Ethernet {
            dst: self.dst_mac,
            src: self.src_mac,
            ethertype: ETHERTYPE_IPV4,
        }
        .serialize(&mut data[..ETHERNET_LEN]);

        Ipv4 {
            ihl: 5,
            total_length: (IPV4_LEN + UDP_LEN + payload_len) as u16,
            ttl: DEFAULT_TTL,
            proto: PROTO_UDP,
            checksum: 0,
            src: self.src_ip,
            dst: self.dst_ip,
        }
        .serialize(&mut data[ETHERNET_LEN..ETHERNET_LEN + IPV4_LEN]);

        Udp {
            src_port: self.src_port,
            dst_port: self.dst_port,
            length: (UDP_LEN + payload_len) as u16,
            // Zero is "no checksum" for UDP over IPv4.
            checksum: 0,
        }
        .serialize(&mut data[ETHERNET_LEN + IPV4_LEN..UDP_PAYLOAD_OFFSET]);

        fill(&mut data[UDP_PAYLOAD_OFFSET..]);

        Ok(())
    }
}
