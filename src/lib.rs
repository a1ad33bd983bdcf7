//! pktsm, a packet driven connection state machine.
//!
//! The engine is sans-IO. It is handed batches of owned packets, routes each
//! packet to the handler of its connection's current state and hands back the
//! packets to transmit. Connection identity, protocol states and packet
//! memory are all supplied by the user:
//!
//! * an [`Identifier`] maps a packet to a connection id,
//! * handlers are registered per [`StateId`] on a [`Builder`],
//! * start states decide which packets open a connection,
//! * end states remove it,
//! * packets are any [`Packet`], heap [`Buf`] or [`Pooled`] buffers.
//!
//! Handlers return a [`Step`] naming the next state and an optional reply.
//!
//! ```
//! use std::net::Ipv4Addr;
//!
//! use pktsm::headers::FrameBuilder;
//! use pktsm::hello_bye::{v1, ServerConfig, ServerStates};
//! use pktsm::{Buf, Error, Outcome};
//!
//! # fn main() -> Result<(), Error> {
//! let server = v1::server::<Buf>(ServerConfig::default())?;
//!
//! let mut hello = Buf::default();
//! FrameBuilder {
//!     src_mac: [2, 0, 0, 0, 0, 1],
//!     dst_mac: [2, 0, 0, 0, 0, 2],
//!     src_ip: Ipv4Addr::new(10, 0, 0, 1),
//!     dst_ip: Ipv4Addr::new(10, 0, 0, 2),
//!     src_port: 40000,
//!     dst_port: 1337,
//! }
//! .write(&mut hello, b"CLIENT HELLO:4\n")?;
//!
//! let out = server.run_pkt_batch(vec![hello]);
//! assert_eq!(out.outcomes, vec![Outcome::Processed { state: ServerStates::BYE }]);
//! assert_eq!(out.send.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! Protocols included:
//!
//! * [`hello_bye`], a toy two message exchange in three wire variants.
//! * [`dtls_client`], the client side of a DTLS session over UDP frames.

#![forbid(unsafe_code)]
#![warn(clippy::all)]
// #![deny(missing_docs)]

#[macro_use]
extern crate log;

mod buffer;
pub use buffer::{Buf, Packet, DEFAULT_BUF_LEN};

mod config;
pub use config::{Config, ConfigBuilder};

mod error;
pub use error::Error;

mod iface;
pub use iface::{FunIface, GetPktFn, TimeoutFn};

mod machine;
pub use machine::{AcceptFn, BatchOutput, Builder, Outcome, StateMachine, Stats};
pub use machine::MAX_START_END_IDS;

mod pool;
pub use pool::{Heap, Pool, Pooled, Strategy};

mod registry;
pub use registry::Handler;

mod rng;
pub use rng::SeededRng;

mod state;
pub use state::{State, StateId, Step};

mod table;

pub mod headers;

pub mod ident;
pub use ident::{FiveTuple, Identifier, Ipv4FiveTuple};

pub mod dtls_client;
pub mod hello_bye;
