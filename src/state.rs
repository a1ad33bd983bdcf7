/// Identifies a position in a protocol's state graph.
pub type StateId = u16;

/// One connection: the state it is in and whatever the protocol keeps for it.
///
/// Owned by the state table of a [`StateMachine`][crate::StateMachine]. Handlers
/// get `&mut` access while a packet for the connection is being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State<C> {
    pub id: StateId,
    pub ctx: C,
}

impl<C> State<C> {
    pub fn new(id: StateId, ctx: C) -> Self {
        State { id, ctx }
    }
}

/// What a handler hands back to the engine.
///
/// `next` is the state the connection moves to. `reply`, if any, is sent
/// out after the handler returns.
#[derive(Debug)]
#[must_use]
pub struct Step<P> {
    pub next: StateId,
    pub reply: Option<P>,
}

impl<P> Step<P> {
    /// Move to `next` and send `pkt`.
    pub fn reply(next: StateId, pkt: P) -> Self {
        Step {
            next,
            reply: Some(pkt),
        }
    }

    /// Move to `next` without sending anything.
    pub fn silent(next: StateId) -> Self {
        Step { next, reply: None }
    }
}
