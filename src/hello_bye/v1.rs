//! Text Hello/Bye keyed by the IPv4 5-tuple.
//!
//! Messages are ASCII lines, `CLIENT HELLO:<d>\n` and so on, with a single
//! decimal digit cookie.

use std::net::Ipv4Addr;
use std::ops::Deref;
use std::sync::Arc;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, satisfy};
use nom::combinator::{opt, value};
use nom::IResult;

use super::{reply_in_place, ClientConfig, ClientStates, Cookies, ServerConfig, ServerStates};
use crate::buffer::Packet;
use crate::headers::{UdpFrame, PROTO_UDP};
use crate::ident::{FiveTuple, Ipv4FiveTuple};
use crate::iface::FunIface;
use crate::machine::{BatchOutput, StateMachine};
use crate::state::{State, Step};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    ClientHello,
    ServerHello,
    ClientBye,
    ServerBye,
}

impl Kind {
    fn prefix(&self) -> &'static str {
        match self {
            Kind::ClientHello => "CLIENT HELLO:",
            Kind::ServerHello => "SERVER HELLO:",
            Kind::ClientBye => "CLIENT BYE:",
            Kind::ServerBye => "SERVER BYE:",
        }
    }
}

/// One text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMsg {
    pub kind: Kind,
    pub cookie: u8,
}

impl TextMsg {
    pub fn new(kind: Kind, cookie: u8) -> Self {
        TextMsg { kind, cookie }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], TextMsg> {
        let (input, kind) = alt((
            value(Kind::ClientHello, tag("CLIENT HELLO:")),
            value(Kind::ServerHello, tag("SERVER HELLO:")),
            value(Kind::ClientBye, tag("CLIENT BYE:")),
            value(Kind::ServerBye, tag("SERVER BYE:")),
        ))(input)?;
        let (input, digit) = satisfy(|c| c.is_ascii_digit())(input)?;
        let (input, _) = opt(char('\n'))(input)?;

        let cookie = digit as u8 - b'0';

        Ok((input, TextMsg { kind, cookie }))
    }

    pub fn serialize(&self) -> Vec<u8> {
        format!("{}{}\n", self.kind.prefix(), self.cookie % 10).into_bytes()
    }
}

/// Server context, one variant per state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCtx {
    Hello { server_cookie: u8 },
    Bye { client_cookie: u8, server_cookie: u8 },
}

/// Client context, one variant per state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCtx {
    Hello { dst_ip: Ipv4Addr, src_port: u16 },
    Bye { client_cookie: u8 },
    RecvBye { client_cookie: u8, server_cookie: u8 },
}

pub type Server<P> = StateMachine<Ipv4FiveTuple, P, ServerCtx>;

type Iface<'a, P, C> = FunIface<'a, FiveTuple, P, C>;

/// Build a server. Every identified packet of an unknown 5-tuple opens a
/// connection in [`ServerStates::HELLO`].
pub fn server<P: Packet + 'static>(config: ServerConfig) -> Result<Server<P>, Error> {
    let cookies = Cookies::new(config.rng_seed);

    let mut builder = StateMachine::builder(Ipv4FiveTuple).config(config.engine);
    builder
        .register_function(ServerStates::HELLO, server_hello)?
        .register_function(ServerStates::BYE, server_bye)?
        .register_start_state_id(ServerStates::HELLO, move |_, _| {
            Ok(Some(ServerCtx::Hello {
                server_cookie: cookies.digit(),
            }))
        })?
        .register_end_state_id(ServerStates::TERMINATE)?;
    builder.build()
}

fn text<P: Packet>(pkt: &P) -> Result<Option<TextMsg>, Error> {
    let data = pkt.data();
    let frame = UdpFrame::parse(data)?;
    Ok(TextMsg::parse(frame.payload(data)).ok().map(|(_, m)| m))
}

fn expect<P: Packet>(pkt: &P, kind: Kind) -> Result<Option<u8>, Error> {
    Ok(text(pkt)?.filter(|m| m.kind == kind).map(|m| m.cookie))
}

fn out_of_step<C: std::fmt::Debug>(ctx: &C) -> Error {
    Error::Protocol(format!("Context out of step: {:?}", ctx))
}

fn server_hello<P: Packet>(
    state: &mut State<ServerCtx>,
    mut pkt: P,
    _: &mut Iface<'_, P, ServerCtx>,
) -> Result<Step<P>, Error> {
    let ServerCtx::Hello { server_cookie } = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let Some(client_cookie) = expect(&pkt, Kind::ClientHello)? else {
        debug!("Server HELLO: not a CLIENT HELLO");
        return Ok(Step::silent(ServerStates::TERMINATE));
    };

    reply_in_place(&mut pkt, &TextMsg::new(Kind::ServerHello, server_cookie).serialize())?;

    state.ctx = ServerCtx::Bye {
        client_cookie,
        server_cookie,
    };
    Ok(Step::reply(ServerStates::BYE, pkt))
}

fn server_bye<P: Packet>(
    state: &mut State<ServerCtx>,
    mut pkt: P,
    _: &mut Iface<'_, P, ServerCtx>,
) -> Result<Step<P>, Error> {
    let ServerCtx::Bye {
        client_cookie,
        server_cookie,
    } = state.ctx
    else {
        return Err(out_of_step(&state.ctx));
    };

    let Some(cookie) = expect(&pkt, Kind::ClientBye)? else {
        debug!("Server BYE: not a CLIENT BYE");
        return Ok(Step::silent(ServerStates::TERMINATE));
    };

    if cookie != server_cookie {
        debug!("Server BYE: wrong cookie {} != {}", cookie, server_cookie);
        return Ok(Step::silent(ServerStates::TERMINATE));
    }

    reply_in_place(&mut pkt, &TextMsg::new(Kind::ServerBye, client_cookie).serialize())?;

    Ok(Step::reply(ServerStates::TERMINATE, pkt))
}

/// Client machine plus the settings its connections share.
pub struct Client<P: Packet> {
    machine: StateMachine<Ipv4FiveTuple, P, ClientCtx>,
    config: Arc<ClientConfig>,
}

impl<P: Packet + 'static> Client<P> {
    /// Build a client. It has no start state, connections are opened with
    /// [`Client::connect`].
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let config = Arc::new(config);
        let cookies = Cookies::new(config.rng_seed);

        let hello_config = Arc::clone(&config);
        let mut builder = StateMachine::builder(Ipv4FiveTuple).config(config.engine.clone());
        builder
            .register_function(ClientStates::HELLO, move |state, pkt, iface| {
                client_hello(&hello_config, &cookies, state, pkt, iface)
            })?
            .register_function(ClientStates::BYE, client_bye)?
            .register_function(ClientStates::RECV_BYE, client_recv_bye)?
            .register_end_state_id(ClientStates::TERMINATE)?;

        Ok(Client {
            machine: builder.build()?,
            config,
        })
    }
}

impl<P: Packet> Client<P> {
    /// The key replies from `dst_ip` to `src_port` are filed under.
    pub fn connection_id(&self, dst_ip: Ipv4Addr, src_port: u16) -> FiveTuple {
        FiveTuple {
            src_ip: self.config.src_ip,
            dst_ip,
            src_port,
            dst_port: self.config.dst_port,
            proto: PROTO_UDP,
        }
        .reversed()
    }

    /// Open a connection to `dst_ip` from `src_port`.
    ///
    /// `pkt` is a blank buffer the CLIENT HELLO is written into.
    pub fn connect(&self, dst_ip: Ipv4Addr, src_port: u16, pkt: P) -> Result<BatchOutput<P>, Error> {
        let id = self.connection_id(dst_ip, src_port);
        let state = State::new(ClientStates::HELLO, ClientCtx::Hello { dst_ip, src_port });
        self.machine.add_state(id, state, pkt)
    }
}

impl<P: Packet> Deref for Client<P> {
    type Target = StateMachine<Ipv4FiveTuple, P, ClientCtx>;

    fn deref(&self) -> &Self::Target {
        &self.machine
    }
}

fn client_hello<P: Packet>(
    config: &ClientConfig,
    cookies: &Cookies,
    state: &mut State<ClientCtx>,
    mut pkt: P,
    _: &mut Iface<'_, P, ClientCtx>,
) -> Result<Step<P>, Error> {
    let ClientCtx::Hello { dst_ip, src_port } = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let client_cookie = cookies.digit();
    let hello = TextMsg::new(Kind::ClientHello, client_cookie).serialize();
    config.frame_to(dst_ip, src_port).write(&mut pkt, &hello)?;

    state.ctx = ClientCtx::Bye { client_cookie };
    Ok(Step::reply(ClientStates::BYE, pkt))
}

fn client_bye<P: Packet>(
    state: &mut State<ClientCtx>,
    mut pkt: P,
    _: &mut Iface<'_, P, ClientCtx>,
) -> Result<Step<P>, Error> {
    let ClientCtx::Bye { client_cookie } = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let Some(server_cookie) = expect(&pkt, Kind::ServerHello)? else {
        debug!("Client BYE: not a SERVER HELLO");
        return Ok(Step::silent(ClientStates::TERMINATE));
    };

    reply_in_place(&mut pkt, &TextMsg::new(Kind::ClientBye, server_cookie).serialize())?;

    state.ctx = ClientCtx::RecvBye {
        client_cookie,
        server_cookie,
    };
    Ok(Step::reply(ClientStates::RECV_BYE, pkt))
}

fn client_recv_bye<P: Packet>(
    state: &mut State<ClientCtx>,
    pkt: P,
    _: &mut Iface<'_, P, ClientCtx>,
) -> Result<Step<P>, Error> {
    let ClientCtx::RecvBye { client_cookie, .. } = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    match expect(&pkt, Kind::ServerBye)? {
        Some(cookie) if cookie == client_cookie => {
            trace!("Client done, cookie {}", cookie);
        }
        Some(cookie) => debug!("Client RECV BYE: wrong cookie {} != {}", cookie, client_cookie),
        None => debug!("Client RECV BYE: not a SERVER BYE"),
    }

    Ok(Step::silent(ClientStates::TERMINATE))
}
