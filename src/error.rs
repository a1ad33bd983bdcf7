use thiserror::Error;

use crate::StateId;

/// Errors surfaced by the state machine and the protocol modules on top of it.
///
/// Setup errors (`DuplicateState`, `NoEndState`, ...) come out of
/// [`Builder::build`][crate::Builder::build] or the `register_*` calls.
/// Everything else is reported per packet in a [`BatchOutput`][crate::BatchOutput]
/// and never aborts the rest of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Packet does not belong to a live connection and no start state accepted it")]
    NoMatchingState,

    #[error("No function registered for state {0}")]
    UnregisteredState(StateId),

    #[error("State {0} is already registered")]
    DuplicateState(StateId),

    #[error("Pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("The identifier could not handle this packet")]
    PacketNotIdentified,

    #[error("No end state registered")]
    NoEndState,

    #[error("End state {0} must not have a function")]
    EndStateHasHandler(StateId),

    #[error("Too many start or end states (max {0})")]
    TooManyStates(usize),

    #[error("Connection already exists")]
    ConnectionExists,

    #[error("No packet source registered")]
    NoPacketSource,

    #[error("Buffer too small, need {need} have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session error: {0}")]
    Session(String),
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::Parse("incomplete".to_string()),
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::Parse(format!("{:?}", e.code)),
        }
    }
}
