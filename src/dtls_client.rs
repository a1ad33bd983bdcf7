//! Client side DTLS over Ethernet/IPv4/UDP frames.
//!
//! The cryptographic work is done by a sans-IO [`DtlsSession`]. The handlers
//! here move datagrams between frames and the session and walk the
//! connection through
//!
//! ```text
//! DOWN -> HANDSHAKE -> ESTABLISHED -> RUN_TEARDOWN -> DELETED
//! ```
//!
//! Once the handshake completes the client sends a first application
//! payload. When the peer echoes it back the client shuts the session down,
//! and the peer's close ends the connection.
//!
//! Retransmissions are driven by the session. When it asks for a timeout
//! the handler arms one through [`FunIface::set_timeout`]; it fires from
//! [`StateMachine::handle_timeout`] unless a packet for the connection comes
//! first.

use std::net::Ipv4Addr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Packet;
use crate::config::Config;
use crate::headers::{FrameBuilder, UdpFrame, PROTO_UDP};
use crate::ident::{FiveTuple, Ipv4FiveTuple};
use crate::iface::FunIface;
use crate::machine::{BatchOutput, StateMachine};
use crate::state::{State, StateId, Step};
use crate::Error;

/// Largest datagram taken from a session in one go.
pub const MAX_DATAGRAM: usize = 1500;

/// Client state ids.
pub struct States;

impl States {
    pub const DOWN: StateId = 0;
    pub const HANDSHAKE: StateId = 1;
    pub const ESTABLISHED: StateId = 2;
    pub const RUN_TEARDOWN: StateId = 3;
    pub const DELETED: StateId = 4;
}

/// What a session wants done next.
#[derive(Debug, PartialEq, Eq)]
pub enum Output<'a> {
    /// A datagram to send to the peer.
    Packet(&'a [u8]),
    /// The handshake completed.
    Connected,
    /// Decrypted data from the peer.
    ApplicationData(&'a [u8]),
    /// The peer closed the session.
    Closed,
    /// Nothing more to do until this instant.
    Timeout(Instant),
}

/// A sans-IO DTLS client session.
///
/// Inputs are fed with `connect`, `handle_packet`, `handle_timeout`,
/// `write` and `shutdown`. Everything they cause is then drained with
/// `poll_output` until it returns [`Output::Timeout`].
pub trait DtlsSession: Send {
    /// Begin the handshake.
    fn connect(&mut self) -> Result<(), Error>;

    /// Feed one datagram received from the peer.
    fn handle_packet(&mut self, datagram: &[u8]) -> Result<(), Error>;

    /// Let time pass, for retransmissions.
    fn handle_timeout(&mut self, now: Instant) -> Result<(), Error>;

    /// Next output. `buf` is scratch space outputs may borrow.
    fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Output<'a>;

    /// Queue application data for the peer.
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Start closing the session.
    fn shutdown(&mut self) -> Result<(), Error>;
}

/// Settings shared by all connections of a client.
#[derive(Debug, Clone)]
pub struct DtlsClientConfig {
    pub engine: Config,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    /// Sent once the handshake completes, expected back before shutdown.
    pub first_payload: Vec<u8>,
}

impl Default for DtlsClientConfig {
    fn default() -> Self {
        DtlsClientConfig {
            engine: Config::default(),
            src_mac: [0x02, 0, 0, 0, 0, 0x01],
            dst_mac: [0x02, 0, 0, 0, 0, 0x02],
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_port: 4433,
            first_payload: b"FIRST PACKET".to_vec(),
        }
    }
}

/// Per connection context.
pub struct ClientCtx<S> {
    session: S,
    frame: FrameBuilder,
    first_payload: Arc<[u8]>,
    scratch: Vec<u8>,
}

impl<S> ClientCtx<S> {
    pub fn session(&self) -> &S {
        &self.session
    }
}

impl<S> std::fmt::Debug for ClientCtx<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCtx")
            .field("frame", &self.frame)
            .finish()
    }
}

/// What a drain of session output turned up besides datagrams.
#[derive(Debug, Default)]
struct Events {
    connected: bool,
    closed: bool,
    echoed: bool,
    timeout: Option<Instant>,
}

type Iface<'a, P, S> = FunIface<'a, FiveTuple, P, ClientCtx<S>>;

/// DTLS client machine.
pub struct DtlsClient<S, P>
where
    S: DtlsSession,
    P: Packet,
{
    machine: StateMachine<Ipv4FiveTuple, P, ClientCtx<S>>,
    config: DtlsClientConfig,
    first_payload: Arc<[u8]>,
}

impl<S, P> DtlsClient<S, P>
where
    S: DtlsSession + 'static,
    P: Packet + 'static,
{
    /// Build a client. `get_pkt` supplies buffers for datagrams beyond the
    /// first one a handler produces.
    pub fn new<F>(config: DtlsClientConfig, get_pkt: F) -> Result<Self, Error>
    where
        F: Fn() -> Result<P, Error> + Send + Sync + 'static,
    {
        let mut builder = StateMachine::builder(Ipv4FiveTuple).config(config.engine.clone());
        builder
            .register_function(States::DOWN, init_handshake)?
            .register_function(States::HANDSHAKE, run_handshake)?
            .register_function(States::ESTABLISHED, recv_data)?
            .register_function(States::RUN_TEARDOWN, run_teardown)?
            .register_end_state_id(States::DELETED)?
            .register_get_pkt_cb(get_pkt);

        Ok(DtlsClient {
            machine: builder.build()?,
            first_payload: config.first_payload.clone().into(),
            config,
        })
    }

    /// The key packets from the server to `src_port` are filed under.
    pub fn connection_id(&self, src_port: u16) -> FiveTuple {
        FiveTuple {
            src_ip: self.config.src_ip,
            dst_ip: self.config.dst_ip,
            src_port,
            dst_port: self.config.dst_port,
            proto: PROTO_UDP,
        }
        .reversed()
    }

    /// Open a connection from `src_port` driven by `session`.
    ///
    /// `pkt` is a blank buffer for the first handshake datagram.
    pub fn connect(&self, session: S, src_port: u16, pkt: P) -> Result<BatchOutput<P>, Error> {
        let ctx = ClientCtx {
            session,
            frame: FrameBuilder {
                src_mac: self.config.src_mac,
                dst_mac: self.config.dst_mac,
                src_ip: self.config.src_ip,
                dst_ip: self.config.dst_ip,
                src_port,
                dst_port: self.config.dst_port,
            },
            first_payload: Arc::clone(&self.first_payload),
            scratch: vec![0; MAX_DATAGRAM],
        };

        let id = self.connection_id(src_port);
        debug!("DTLS connect {}", id.reversed());
        self.machine
            .add_state(id, State::new(States::DOWN, ctx), pkt)
    }
}

impl<S, P> Deref for DtlsClient<S, P>
where
    S: DtlsSession,
    P: Packet,
{
    type Target = StateMachine<Ipv4FiveTuple, P, ClientCtx<S>>;

    fn deref(&self) -> &Self::Target {
        &self.machine
    }
}

/// Feed the UDP payload of `pkt` to the session.
fn feed<S: DtlsSession, P: Packet>(ctx: &mut ClientCtx<S>, pkt: &P) -> Result<(), Error> {
    let data = pkt.data();
    let frame = UdpFrame::parse(data)?;
    ctx.session.handle_packet(frame.payload(data))
}

/// Move everything the session has to say into frames.
///
/// The first datagram goes into `reply` if there is one, the rest into
/// buffers from [`FunIface::get_pkt`]. Returns the reply if it was used.
fn drain<S, P>(
    ctx: &mut ClientCtx<S>,
    mut reply: Option<P>,
    iface: &mut Iface<'_, P, S>,
) -> Result<(Option<P>, Events), Error>
where
    S: DtlsSession,
    P: Packet,
{
    let mut used = None;
    let mut events = Events::default();

    loop {
        match ctx.session.poll_output(&mut ctx.scratch) {
            Output::Packet(datagram) => {
                let mut pkt = match reply.take() {
                    Some(pkt) => pkt,
                    None => iface.get_pkt()?,
                };
                ctx.frame.write(&mut pkt, datagram)?;
                if used.is_none() {
                    used = Some(pkt);
                } else {
                    iface.send(pkt);
                }
            }
            Output::Connected => events.connected = true,
            Output::ApplicationData(data) => {
                if data == &*ctx.first_payload {
                    events.echoed = true;
                } else {
                    debug!("Unexpected application data, {} bytes", data.len());
                }
            }
            Output::Closed => events.closed = true,
            Output::Timeout(at) => {
                events.timeout = Some(at);
                break;
            }
        }
    }

    Ok((used, events))
}

/// Keep `more` as the reply if there is none yet, send it otherwise.
fn merge<S, P>(reply: &mut Option<P>, more: Option<P>, iface: &mut Iface<'_, P, S>) {
    let Some(more) = more else {
        return;
    };
    if reply.is_none() {
        *reply = Some(more);
    } else {
        iface.send(more);
    }
}

/// Arm the session's retransmission timeout, if it asked for one.
fn arm<S, P>(events: &Events, iface: &mut Iface<'_, P, S>)
where
    S: DtlsSession + 'static,
    P: Packet + 'static,
{
    let Some(at) = events.timeout else {
        return;
    };
    let after = at.saturating_duration_since(Instant::now());
    iface.set_timeout(after, on_timeout::<S, P>);
}

fn on_timeout<S, P>(
    state: &mut State<ClientCtx<S>>,
    iface: &mut Iface<'_, P, S>,
) -> Result<Step<P>, Error>
where
    S: DtlsSession + 'static,
    P: Packet + 'static,
{
    trace!("DTLS timeout in state {}", state.id);
    state.ctx.session.handle_timeout(Instant::now())?;

    let (reply, events) = drain(&mut state.ctx, None, iface)?;
    if events.closed {
        return Ok(Step {
            next: States::DELETED,
            reply,
        });
    }
    arm(&events, iface);

    Ok(Step {
        next: state.id,
        reply,
    })
}

fn init_handshake<S, P>(
    state: &mut State<ClientCtx<S>>,
    pkt: P,
    iface: &mut Iface<'_, P, S>,
) -> Result<Step<P>, Error>
where
    S: DtlsSession + 'static,
    P: Packet + 'static,
{
    state.ctx.session.connect()?;

    let (reply, events) = drain(&mut state.ctx, Some(pkt), iface)?;
    if reply.is_none() {
        return Err(Error::Session("connect produced no datagram".into()));
    }
    arm(&events, iface);

    Ok(Step {
        next: States::HANDSHAKE,
        reply,
    })
}

fn run_handshake<S, P>(
    state: &mut State<ClientCtx<S>>,
    pkt: P,
    iface: &mut Iface<'_, P, S>,
) -> Result<Step<P>, Error>
where
    S: DtlsSession + 'static,
    P: Packet + 'static,
{
    let ctx = &mut state.ctx;
    feed(ctx, &pkt)?;

    let (mut reply, mut events) = drain(ctx, Some(pkt), iface)?;

    if events.closed {
        debug!("DTLS peer closed during handshake");
        return Ok(Step {
            next: States::DELETED,
            reply,
        });
    }

    let mut next = States::HANDSHAKE;

    if events.connected {
        debug!("DTLS connection established {}", ctx.frame.dst_ip);
        let first = Arc::clone(&ctx.first_payload);
        ctx.session.write(&first)?;

        let (more, more_events) = drain(ctx, None, iface)?;
        merge(&mut reply, more, iface);
        events = more_events;
        next = States::ESTABLISHED;
    }
    arm(&events, iface);

    Ok(Step { next, reply })
}

fn recv_data<S, P>(
    state: &mut State<ClientCtx<S>>,
    pkt: P,
    iface: &mut Iface<'_, P, S>,
) -> Result<Step<P>, Error>
where
    S: DtlsSession + 'static,
    P: Packet + 'static,
{
    let ctx = &mut state.ctx;
    feed(ctx, &pkt)?;

    let (mut reply, mut events) = drain(ctx, Some(pkt), iface)?;

    if events.closed {
        debug!("DTLS peer closed before echo");
        return Ok(Step {
            next: States::DELETED,
            reply,
        });
    }

    let mut next = States::ESTABLISHED;

    if events.echoed {
        trace!("DTLS first payload echoed, shutting down");
        ctx.session.shutdown()?;

        let (more, more_events) = drain(ctx, None, iface)?;
        merge(&mut reply, more, iface);
        events = more_events;
        next = States::RUN_TEARDOWN;
    }
    arm(&events, iface);

    Ok(Step { next, reply })
}

fn run_teardown<S, P>(
    state: &mut State<ClientCtx<S>>,
    pkt: P,
    iface: &mut Iface<'_, P, S>,
) -> Result<Step<P>, Error>
where
    S: DtlsSession + 'static,
    P: Packet + 'static,
{
    let ctx = &mut state.ctx;
    feed(ctx, &pkt)?;

    let (reply, events) = drain(ctx, Some(pkt), iface)?;

    if events.closed {
        debug!("DTLS teardown complete {}", ctx.frame.dst_ip);
        return Ok(Step {
            next: States::DELETED,
            reply,
        });
    }
    arm(&events, iface);

    Ok(Step {
        next: States::RUN_TEARDOWN,
        reply,
    })
}
