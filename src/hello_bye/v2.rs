//! Binary Hello/Bye keyed by the message `ident`.
//!
//! Every state has its own context type. A transition consumes the context
//! of the state it leaves and builds the next one from it.

use std::net::Ipv4Addr;
use std::ops::Deref;
use std::sync::Arc;

use super::{read_msg, reply_msg, ClientConfig, ClientStates, Cookies, Msg, MsgIdent, ServerConfig};
use super::{ServerStates, MSG_BYE, MSG_HELLO, MSG_LEN, ROLE_CLIENT, ROLE_SERVER};
use crate::buffer::Packet;
use crate::iface::FunIface;
use crate::machine::{BatchOutput, StateMachine};
use crate::state::{State, Step};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHello {
    pub server_cookie: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerBye {
    pub client_cookie: u8,
    pub server_cookie: u8,
}

impl ServerHello {
    fn into_bye(self, client_cookie: u8) -> ServerBye {
        ServerBye {
            client_cookie,
            server_cookie: self.server_cookie,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCtx {
    Hello(ServerHello),
    Bye(ServerBye),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello {
    pub ident: u64,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientBye {
    pub client_cookie: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRecvBye {
    pub client_cookie: u8,
    pub server_cookie: u8,
}

impl ClientHello {
    fn into_bye(self, client_cookie: u8) -> ClientBye {
        ClientBye { client_cookie }
    }
}

impl ClientBye {
    fn into_recv_bye(self, server_cookie: u8) -> ClientRecvBye {
        ClientRecvBye {
            client_cookie: self.client_cookie,
            server_cookie,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCtx {
    Hello(ClientHello),
    Bye(ClientBye),
    RecvBye(ClientRecvBye),
}

pub type Server<P> = StateMachine<MsgIdent, P, ServerCtx>;

type Iface<'a, P, C> = FunIface<'a, u64, P, C>;

fn out_of_step<C: std::fmt::Debug>(ctx: &C) -> Error {
    Error::Protocol(format!("Context out of step: {:?}", ctx))
}

/// Build a server. Every packet with an unknown `ident` opens a
/// connection in [`ServerStates::HELLO`].
pub fn server<P: Packet + 'static>(config: ServerConfig) -> Result<Server<P>, Error> {
    let cookies = Cookies::new(config.rng_seed);

    let mut builder = StateMachine::builder(MsgIdent).config(config.engine);
    builder
        .register_function(ServerStates::HELLO, server_hello)?
        .register_function(ServerStates::BYE, server_bye)?
        .register_start_state_id(ServerStates::HELLO, move |_, _| {
            Ok(Some(ServerCtx::Hello(ServerHello {
                server_cookie: cookies.byte(),
            })))
        })?
        .register_end_state_id(ServerStates::TERMINATE)?;
    builder.build()
}

fn server_hello<P: Packet>(
    state: &mut State<ServerCtx>,
    mut pkt: P,
    _: &mut Iface<'_, P, ServerCtx>,
) -> Result<Step<P>, Error> {
    let ServerCtx::Hello(hello) = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let msg = read_msg(&pkt)?;
    if !msg.is(ROLE_CLIENT, MSG_HELLO) {
        debug!("Server HELLO: unexpected {:?}", msg);
        return Ok(Step::silent(ServerStates::TERMINATE));
    }

    let reply = Msg::new(msg.ident, ROLE_SERVER, MSG_HELLO, hello.server_cookie);
    reply_msg(&mut pkt, &reply)?;

    state.ctx = ServerCtx::Bye(hello.into_bye(msg.cookie));
    Ok(Step::reply(ServerStates::BYE, pkt))
}

fn server_bye<P: Packet>(
    state: &mut State<ServerCtx>,
    mut pkt: P,
    _: &mut Iface<'_, P, ServerCtx>,
) -> Result<Step<P>, Error> {
    let ServerCtx::Bye(bye) = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let msg = read_msg(&pkt)?;
    if !msg.is(ROLE_CLIENT, MSG_BYE) {
        debug!("Server BYE: unexpected {:?}", msg);
        return Ok(Step::silent(ServerStates::TERMINATE));
    }
    if msg.cookie != bye.server_cookie {
        debug!("Server BYE: wrong cookie {} != {}", msg.cookie, bye.server_cookie);
        return Ok(Step::silent(ServerStates::TERMINATE));
    }

    let reply = Msg::new(msg.ident, ROLE_SERVER, MSG_BYE, bye.client_cookie);
    reply_msg(&mut pkt, &reply)?;

    Ok(Step::reply(ServerStates::TERMINATE, pkt))
}

/// Client machine plus the settings its connections share.
pub struct Client<P: Packet> {
    machine: StateMachine<MsgIdent, P, ClientCtx>,
}

impl<P: Packet + 'static> Client<P> {
    /// Build a client. Connections are opened with [`Client::connect`].
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let config = Arc::new(config);
        let cookies = Cookies::new(config.rng_seed);

        let mut builder = StateMachine::builder(MsgIdent).config(config.engine.clone());
        builder
            .register_function(ClientStates::HELLO, move |state, pkt, iface| {
                client_hello(&config, &cookies, state, pkt, iface)
            })?
            .register_function(ClientStates::BYE, client_bye)?
            .register_function(ClientStates::RECV_BYE, client_recv_bye)?
            .register_end_state_id(ClientStates::TERMINATE)?;

        Ok(Client {
            machine: builder.build()?,
        })
    }
}

impl<P: Packet> Client<P> {
    /// Open connection `ident` to `dst_ip` from `src_port`.
    ///
    /// `pkt` is a blank buffer the HELLO is written into.
    pub fn connect(
        &self,
        ident: u64,
        dst_ip: Ipv4Addr,
        src_port: u16,
        pkt: P,
    ) -> Result<BatchOutput<P>, Error> {
        let hello = ClientHello {
            ident,
            dst_ip,
            src_port,
        };
        let state = State::new(ClientStates::HELLO, ClientCtx::Hello(hello));
        self.machine.add_state(ident, state, pkt)
    }
}

impl<P: Packet> Deref for Client<P> {
    type Target = StateMachine<MsgIdent, P, ClientCtx>;

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
    let ClientCtx::Hello(hello) = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let client_cookie = cookies.byte();
    let msg = Msg::new(hello.ident, ROLE_CLIENT, MSG_HELLO, client_cookie);
    config
        .frame_to(hello.dst_ip, hello.src_port)
        .write_with(&mut pkt, MSG_LEN, |out| msg.serialize(out))?;

    state.ctx = ClientCtx::Bye(hello.into_bye(client_cookie));
    Ok(Step::reply(ClientStates::BYE, pkt))
}

fn client_bye<P: Packet>(
    state: &mut State<ClientCtx>,
    mut pkt: P,
    _: &mut Iface<'_, P, ClientCtx>,
) -> Result<Step<P>, Error> {
    let ClientCtx::Bye(bye) = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let msg = read_msg(&pkt)?;
    if !msg.is(ROLE_SERVER, MSG_HELLO) {
        debug!("Client BYE: unexpected {:?}", msg);
        return Ok(Step::silent(ClientStates::TERMINATE));
    }

    let reply = Msg::new(msg.ident, ROLE_CLIENT, MSG_BYE, msg.cookie);
    reply_msg(&mut pkt, &reply)?;

    state.ctx = ClientCtx::RecvBye(bye.into_recv_bye(msg.cookie));
    Ok(Step::reply(ClientStates::RECV_BYE, pkt))
}

fn client_recv_bye<P: Packet>(
    state: &mut State<ClientCtx>,
    pkt: P,
    _: &mut Iface<'_, P, ClientCtx>,
) -> Result<Step<P>, Error> {
    let ClientCtx::RecvBye(recv) = state.ctx else {
        return Err(out_of_step(&state.ctx));
    };

    let msg = read_msg(&pkt)?;
    if !msg.is(ROLE_SERVER, MSG_BYE) {
        debug!("Client RECV BYE: unexpected {:?}", msg);
    } else if msg.cookie != recv.client_cookie {
        debug!("Client RECV BYE: wrong cookie {} != {}", msg.cookie, recv.client_cookie);
    } else {
        trace!("Client {} done", msg.ident);
    }

    Ok(Step::silent(ClientStates::TERMINATE))
}
