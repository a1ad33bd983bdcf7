//! Binary Hello/Bye with one flat context per connection.
//!
//! Same wire format as [`v2`][super::v2]. The context lives in memory from
//! a [`Strategy`], so a server can run with a hard connection limit by
//! using a [`Pool`][crate::Pool]:
//!
//! ```
//! use pktsm::{Buf, Pool};
//! use pktsm::hello_bye::{v3, ServerConfig};
//!
//! let pool: Pool<v3::ServerCtx> = Pool::new(1024);
//! let server = v3::server::<_, Buf>(ServerConfig::default(), pool).unwrap();
//! assert_eq!(server.state_table_len(), 0);
//! ```

use std::net::Ipv4Addr;
use std::ops::{Deref, DerefMut};

use super::{read_msg, reply_msg, ClientConfig, ClientStates, Cookies, Msg, MsgIdent, ServerConfig};
use super::{ServerStates, MSG_BYE, MSG_HELLO, MSG_LEN, ROLE_CLIENT, ROLE_SERVER};
use crate::buffer::Packet;
use crate::iface::FunIface;
use crate::machine::{BatchOutput, StateMachine};
use crate::pool::Strategy;
use crate::state::{State, Step};
use crate::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCtx {
    pub client_cookie: u8,
    pub server_cookie: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCtx {
    pub ident: u64,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub client_cookie: u8,
    pub server_cookie: u8,
}

impl Default for ClientCtx {
    fn default() -> Self {
        ClientCtx {
            ident: 0,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            client_cookie: 0,
            server_cookie: 0,
        }
    }
}

pub type Server<S, P> = StateMachine<MsgIdent, P, <S as Strategy<ServerCtx>>::Handle>;

type Iface<'a, P, C> = FunIface<'a, u64, P, C>;

/// Build a server taking connection contexts from `strategy`.
///
/// A packet opening a connection while the strategy is exhausted is
/// dropped with [`Error::PoolExhausted`].
pub fn server<S, P>(config: ServerConfig, strategy: S) -> Result<Server<S, P>, Error>
where
    S: Strategy<ServerCtx> + 'static,
    S::Handle: 'static,
    P: Packet + 'static,
{
    let cookies = Cookies::new(config.rng_seed);

    let mut builder = StateMachine::builder(MsgIdent).config(config.engine);
    builder
        .register_function(ServerStates::HELLO, server_hello::<S::Handle, P>)?
        .register_function(ServerStates::BYE, server_bye::<S::Handle, P>)?
        .register_start_state_id(ServerStates::HELLO, move |_, _| {
            let ctx = ServerCtx {
                client_cookie: 0,
                server_cookie: cookies.byte(),
            };
            strategy.acquire(ctx).map(Some)
        })?
        .register_end_state_id(ServerStates::TERMINATE)?;
    builder.build()
}

fn server_hello<H, P>(state: &mut State<H>, mut pkt: P, _: &mut Iface<'_, P, H>) -> Result<Step<P>, Error>
where
    H: DerefMut<Target = ServerCtx>,
    P: Packet,
{
    let msg = read_msg(&pkt)?;
    if !msg.is(ROLE_CLIENT, MSG_HELLO) {
        debug!("Server HELLO: unexpected {:?}", msg);
        return Ok(Step::silent(ServerStates::TERMINATE));
    }

    let ctx = &mut *state.ctx;
    ctx.client_cookie = msg.cookie;

    let reply = Msg::new(msg.ident, ROLE_SERVER, MSG_HELLO, ctx.server_cookie);
    reply_msg(&mut pkt, &reply)?;

    Ok(Step::reply(ServerStates::BYE, pkt))
}

fn server_bye<H, P>(state: &mut State<H>, mut pkt: P, _: &mut Iface<'_, P, H>) -> Result<Step<P>, Error>
where
    H: DerefMut<Target = ServerCtx>,
    P: Packet,
{
    let msg = read_msg(&pkt)?;
    if !msg.is(ROLE_CLIENT, MSG_BYE) {
        debug!("Server BYE: unexpected {:?}", msg);
        return Ok(Step::silent(ServerStates::TERMINATE));
    }

    let ctx = &*state.ctx;
    if msg.cookie != ctx.server_cookie {
        debug!("Server BYE: wrong cookie {} != {}", msg.cookie, ctx.server_cookie);
        return Ok(Step::silent(ServerStates::TERMINATE));
    }

    let reply = Msg::new(msg.ident, ROLE_SERVER, MSG_BYE, ctx.client_cookie);
    reply_msg(&mut pkt, &reply)?;

    Ok(Step::reply(ServerStates::TERMINATE, pkt))
}

/// Client machine with contexts from a memory strategy.
pub struct Client<S, P>
where
    S: Strategy<ClientCtx>,
    P: Packet,
{
    machine: StateMachine<MsgIdent, P, S::Handle>,
    strategy: S,
}

impl<S, P> Client<S, P>
where
    S: Strategy<ClientCtx> + 'static,
    S::Handle: 'static,
    P: Packet + 'static,
{
    pub fn new(config: ClientConfig, strategy: S) -> Result<Self, Error> {
        let cookies = Cookies::new(config.rng_seed);
        let engine = config.engine.clone();

        let mut builder = StateMachine::builder(MsgIdent).config(engine);
        builder
            .register_function(ClientStates::HELLO, move |state, pkt, iface| {
                client_hello(&config, &cookies, state, pkt, iface)
            })?
            .register_function(ClientStates::BYE, client_bye::<S::Handle, P>)?
            .register_function(ClientStates::RECV_BYE, client_recv_bye::<S::Handle, P>)?
            .register_end_state_id(ClientStates::TERMINATE)?;

        Ok(Client {
            machine: builder.build()?,
            strategy,
        })
    }

    /// Open connection `ident` to `dst_ip` from `src_port`.
    ///
    /// Fails with [`Error::PoolExhausted`] when no context can be acquired.
    pub fn connect(
        &self,
        ident: u64,
        dst_ip: Ipv4Addr,
        src_port: u16,
        pkt: P,
    ) -> Result<BatchOutput<P>, Error> {
        let ctx = self.strategy.acquire(ClientCtx {
            ident,
            dst_ip,
            src_port,
            ..Default::default()
        })?;
        self.machine
            .add_state(ident, State::new(ClientStates::HELLO, ctx), pkt)
    }
}

impl<S, P> Deref for Client<S, P>
where
    S: Strategy<ClientCtx>,
    P: Packet,
{
    type Target = StateMachine<MsgIdent, P, S::Handle>;

    fn deref(&self) -> &Self::Target {
        &self.machine
    }
}

fn client_hello<H, P>(
    config: &ClientConfig,
    cookies: &Cookies,
    state: &mut State<H>,
    mut pkt: P,
    _: &mut Iface<'_, P, H>,
) -> Result<Step<P>, Error>
where
    H: DerefMut<Target = ClientCtx>,
    P: Packet,
{
    let ctx = &mut *state.ctx;
    ctx.client_cookie = cookies.byte();

    let msg = Msg::new(ctx.ident, ROLE_CLIENT, MSG_HELLO, ctx.client_cookie);
    config
        .frame_to(ctx.dst_ip, ctx.src_port)
        .write_with(&mut pkt, MSG_LEN, |out| msg.serialize(out))?;

    Ok(Step::reply(ClientStates::BYE, pkt))
}

fn client_bye<H, P>(state: &mut State<H>, mut pkt: P, _: &mut Iface<'_, P, H>) -> Result<Step<P>, Error>
where
    H: DerefMut<Target = ClientCtx>,
    P: Packet,
{
    let msg = read_msg(&pkt)?;
    if !msg.is(ROLE_SERVER, MSG_HELLO) {
        debug!("Client BYE: unexpected {:?}", msg);
        return Ok(Step::silent(ClientStates::TERMINATE));
    }

    state.ctx.server_cookie = msg.cookie;

    let reply = Msg::new(msg.ident, ROLE_CLIENT, MSG_BYE, msg.cookie);
    reply_msg(&mut pkt, &reply)?;

    Ok(Step::reply(ClientStates::RECV_BYE, pkt))
}

fn client_recv_bye<H, P>(state: &mut State<H>, pkt: P, _: &mut Iface<'_, P, H>) -> Result<Step<P>, Error>
where
    H: DerefMut<Target = ClientCtx>,
    P: Packet,
{
    let msg = read_msg(&pkt)?;
    let expected = state.ctx.client_cookie;

    if !msg.is(ROLE_SERVER, MSG_BYE) {
        debug!("Client RECV BYE: unexpected {:?}", msg);
    } else if msg.cookie != expected {
        debug!("Client RECV BYE: wrong cookie {} != {}", msg.cookie, expected);
    } else {
        trace!("Client {} done", msg.ident);
    }

    Ok(Step::silent(ClientStates::TERMINATE))
}
