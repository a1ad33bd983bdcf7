use std::fmt;
use std::time::{Duration, Instant};

use crate::state::{State, Step};
use crate::Error;

/// Packet source registered with
/// [`Builder::register_get_pkt_cb`][crate::Builder::register_get_pkt_cb].
pub type GetPktFn<P> = dyn Fn() -> Result<P, Error> + Send + Sync;

/// Function run when a handler armed timeout expires.
///
/// Runs with the connection's state like a handler, just without a packet.
pub type TimeoutFn<K, P, C> =
    Box<dyn FnOnce(&mut State<C>, &mut FunIface<'_, K, P, C>) -> Result<Step<P>, Error> + Send>;

/// Services the engine offers a running handler.
///
/// Lives for one handler invocation. Whatever was sent or armed through it
/// is collected by the engine when the handler returns.
pub struct FunIface<'a, K, P, C> {
    id: &'a K,
    get_pkt: Option<&'a GetPktFn<P>>,
    sent: Vec<P>,
    timeout: Option<(Instant, TimeoutFn<K, P, C>)>,
}

impl<'a, K, P, C> FunIface<'a, K, P, C> {
    pub(crate) fn new(id: &'a K, get_pkt: Option<&'a GetPktFn<P>>) -> Self {
        FunIface {
            id,
            get_pkt,
            sent: Vec::new(),
            timeout: None,
        }
    }

    /// Identity of the connection being handled.
    pub fn connection_id(&self) -> &K {
        self.id
    }

    /// Obtain an extra blank buffer from the registered packet source.
    ///
    /// [`Error::NoPacketSource`] if none was registered, or whatever the
    /// source fails with, for instance [`Error::PoolExhausted`].
    pub fn get_pkt(&mut self) -> Result<P, Error> {
        match self.get_pkt {
            Some(f) => f(),
            None => Err(Error::NoPacketSource),
        }
    }

    /// Queue an outbound packet besides the handler's reply.
    ///
    /// Sent after the reply, in call order. Discarded if the handler fails.
    pub fn send(&mut self, pkt: P) {
        self.sent.push(pkt);
    }

    /// Arm a timeout for this connection.
    ///
    /// Replaces one armed earlier in the same invocation. Cancelled when the
    /// next packet for the connection arrives or the connection ends.
    /// Ignored if `after` reaches past what [`Instant`] can represent.
    pub fn set_timeout<F>(&mut self, after: Duration, fun: F)
    where
        K: fmt::Debug,
        F: FnOnce(&mut State<C>, &mut FunIface<'_, K, P, C>) -> Result<Step<P>, Error>
            + Send
            + 'static,
    {
        match Instant::now().checked_add(after) {
            Some(at) => self.timeout = Some((at, Box::new(fun))),
            None => warn!("Timeout {:?} out of range, ignoring it for {:?}", after, self.id),
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<P>, Option<(Instant, TimeoutFn<K, P, C>)>) {
        (self.sent, self.timeout)
    }
}

impl<K: fmt::Debug, P, C> fmt::Debug for FunIface<'_, K, P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunIface")
            .field("id", self.id)
            .field("has_get_pkt", &self.get_pkt.is_some())
            .field("sent", &self.sent.len())
            .field("timeout", &self.timeout.as_ref().map(|(at, _)| at))
            .finish()
    }
}
