//! Registration and build time validation.

use pktsm::{Buf, Builder, Config, Error, Outcome, StateMachine, Step, MAX_START_END_IDS};

use crate::common::*;

fn empty() -> Builder<FirstByte, Buf, u32> {
    StateMachine::builder(FirstByte)
}

#[test]
fn duplicate_function_rejected() {
    init_log();
    let mut b = builder(Config::default());

    let err = b
        .register_function(HELLO, |_, _, _| Ok(Step::silent(END)))
        .unwrap_err();
    assert_eq!(err, Error::DuplicateState(HELLO));

    // The first registration still answers.
    let m = b.build().unwrap();
    let out = m.run_pkt_batch(vec![pkt(1, KIND_HELLO)]);
    assert_eq!(out.outcomes, vec![Outcome::Processed { state: BYE }]);
    assert_eq!(out.send.len(), 1);
}

#[test]
fn duplicate_start_rejected() {
    let mut b = builder(Config::default());
    let err = b.register_start_state_id(HELLO, |_, _| Ok(None)).unwrap_err();
    assert_eq!(err, Error::DuplicateState(HELLO));
}

#[test]
fn duplicate_end_is_noop() {
    let mut b = builder(Config::default());
    b.register_end_state_id(END).unwrap();
    assert!(b.build().is_ok());
}

#[test]
fn no_end_state() {
    let mut b = empty();
    b.register_function(HELLO, |_, pkt, _| Ok(Step::reply(HELLO, pkt)))
        .unwrap();
    assert_eq!(b.build().unwrap_err(), Error::NoEndState);
}

#[test]
fn start_state_needs_handler() {
    let mut b = empty();
    b.register_start_state_id(HELLO, |_, _| Ok(Some(0)))
        .unwrap()
        .register_end_state_id(END)
        .unwrap();
    assert_eq!(b.build().unwrap_err(), Error::UnregisteredState(HELLO));
}

#[test]
fn end_state_cannot_have_handler() {
    let mut b = empty();
    b.register_function(END, |_, _, _| Ok(Step::silent(END)))
        .unwrap()
        .register_end_state_id(END)
        .unwrap();
    assert_eq!(b.build().unwrap_err(), Error::EndStateHasHandler(END));
}

#[test]
fn start_and_end_ids_are_bounded() {
    let mut b = empty();
    for id in 0..MAX_START_END_IDS as u16 {
        b.register_start_state_id(id, |_, _| Ok(None)).unwrap();
        b.register_end_state_id(100 + id).unwrap();
    }

    assert_eq!(
        b.register_start_state_id(99, |_, _| Ok(None)).unwrap_err(),
        Error::TooManyStates(MAX_START_END_IDS)
    );
    assert_eq!(
        b.register_end_state_id(99).unwrap_err(),
        Error::TooManyStates(MAX_START_END_IDS)
    );
}

#[test]
fn start_states_tried_in_order() {
    init_log();
    let mut b = empty();
    b.register_function(HELLO, |_, _, _| Ok(Step::silent(HELLO)))
        .unwrap()
        .register_function(BYE, |_, _, _| Ok(Step::silent(BYE)))
        .unwrap()
        .register_start_state_id(BYE, |_, pkt| Ok((kind(pkt) == KIND_BYE).then_some(0)))
        .unwrap()
        .register_start_state_id(HELLO, |_, _| Ok(Some(0)))
        .unwrap()
        .register_end_state_id(END)
        .unwrap();
    let m = b.build().unwrap();

    m.run_pkt_batch(vec![pkt(1, KIND_BYE), pkt(2, KIND_HELLO)]);
    assert_eq!(m.current_state(&1), Some(BYE));
    assert_eq!(m.current_state(&2), Some(HELLO));
}

#[test]
fn config_rejects_zero() {
    assert!(matches!(
        Config::builder().shards(0).build(),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Config::builder().workers(0).build(),
        Err(Error::Config(_))
    ));
}

#[test]
fn config_is_kept() {
    let config = Config::builder()
        .shards(8)
        .workers(3)
        .max_timeouts(10)
        .build()
        .unwrap();
    let m = builder(config).build().unwrap();
    assert_eq!(m.config().shards(), 8);
    assert_eq!(m.config().workers(), 3);
    assert_eq!(m.config().max_timeouts(), 10);
}
