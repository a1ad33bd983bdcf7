//! Hello/Bye, a toy two round trip exchange over UDP.
//!
//! ```text
//!   client                      server
//!     |  CLIENT HELLO (c)  ->     |
//!     |  <-  SERVER HELLO (s)     |
//!     |  CLIENT BYE (s)    ->     |
//!     |  <-  SERVER BYE (c)       |
//! ```
//!
//! Each side picks a cookie and expects its own cookie echoed back in the
//! peer's BYE. Anything unexpected ends the connection without a reply.
//!
//! Three variants:
//!
//! * [`v1`], text payload, connections keyed by the IPv4 5-tuple.
//! * [`v2`], binary [`Msg`] payload keyed by its `ident`, one context type per state.
//! * [`v3`], same wire format as v2, one flat context allocated through a
//!   memory [`Strategy`][crate::Strategy].

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::Packet;
use crate::config::Config;
use crate::headers::{FrameBuilder, UdpFrame};
use crate::ident::Identifier;
use crate::rng::SeededRng;
use crate::state::StateId;
use crate::Error;

mod msg;
pub use msg::{Msg, MSG_BYE, MSG_HELLO, MSG_LEN, ROLE_CLIENT, ROLE_SERVER};

pub mod v1;
pub mod v2;
pub mod v3;

/// Server state ids.
pub struct ServerStates;

impl ServerStates {
    pub const HELLO: StateId = 0;
    pub const BYE: StateId = 1;
    pub const TERMINATE: StateId = 2;
}

/// Client state ids.
pub struct ClientStates;

impl ClientStates {
    pub const HELLO: StateId = 0;
    pub const BYE: StateId = 1;
    pub const RECV_BYE: StateId = 2;
    pub const TERMINATE: StateId = 3;
}

/// Server side settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub engine: Config,
    /// Seed for the server cookies. Random if `None`.
    pub rng_seed: Option<u64>,
}

/// Client side settings, shared by all connections a client opens.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub engine: Config,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    /// Server port every connection goes to.
    pub dst_port: u16,
    /// Seed for the client cookies. Random if `None`.
    pub rng_seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            engine: Config::default(),
            src_mac: [0x02, 0, 0, 0, 0, 0x01],
            dst_mac: [0x02, 0, 0, 0, 0, 0x02],
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_port: 1337,
            rng_seed: None,
        }
    }
}

impl ClientConfig {
    fn frame_to(&self, dst_ip: Ipv4Addr, src_port: u16) -> FrameBuilder {
        FrameBuilder {
            src_mac: self.src_mac,
            dst_mac: self.dst_mac,
            src_ip: self.src_ip,
            dst_ip,
            src_port,
            dst_port: self.dst_port,
        }
    }
}

/// Identity from the `ident` field of a [`Msg`] in an Ethernet/IPv4/UDP frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgIdent;

impl<P: Packet> Identifier<P> for MsgIdent {
    type ConnectionId = u64;

    fn identify(&self, pkt: &P) -> Result<u64, Error> {
        let data = pkt.data();
        let msg = UdpFrame::parse(data)
            .ok()
            .and_then(|frame| Msg::parse(frame.payload(data)).ok());

        match msg {
            Some((_, msg)) => Ok(msg.ident),
            None => {
                trace!("No Hello/Bye message, len: {}", data.len());
                Err(Error::PacketNotIdentified)
            }
        }
    }
}

/// Cookie source shared by the handlers of one machine.
#[derive(Clone)]
pub(crate) struct Cookies(Arc<Mutex<SeededRng>>);

impl Cookies {
    pub fn new(seed: Option<u64>) -> Self {
        Cookies(Arc::new(Mutex::new(SeededRng::new(seed))))
    }

    /// Any byte.
    pub fn byte(&self) -> u8 {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).random()
    }

    /// A single decimal digit.
    pub fn digit(&self) -> u8 {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).below(10)
    }
}

/// Parse the [`Msg`] a frame carries.
pub(crate) fn read_msg<P: Packet>(pkt: &P) -> Result<Msg, Error> {
    let data = pkt.data();
    let frame = UdpFrame::parse(data)?;
    let (_, msg) = Msg::parse(frame.payload(data))?;
    Ok(msg)
}

/// Turn a received frame into the reply to its sender carrying `payload`.
pub(crate) fn reply_in_place<P: Packet>(pkt: &mut P, payload: &[u8]) -> Result<(), Error> {
    let frame = UdpFrame::parse(pkt.data())?;
    frame.reflected().write(pkt, payload)
}

/// Reply to a received frame with a [`Msg`].
pub(crate) fn reply_msg<P: Packet>(pkt: &mut P, msg: &Msg) -> Result<(), Error> {
    let frame = UdpFrame::parse(pkt.data())?;
    frame
        .reflected()
        .write_with(pkt, MSG_LEN, |out| msg.serialize(out))
}
