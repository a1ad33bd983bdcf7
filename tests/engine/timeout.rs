//! Per connection timeouts.

use std::time::{Duration, Instant};

use pktsm::{Buf, Builder, Config, Outcome, Packet, StateMachine, Step};

use crate::common::*;

const WAIT: Duration = Duration::from_millis(50);

/// HELLO arms a timeout that sends a `T` packet and ends the connection.
fn machine(config: Config) -> StateMachine<FirstByte, Buf, u32> {
    let mut b: Builder<FirstByte, Buf, u32> = StateMachine::builder(FirstByte).config(config);
    b.register_function(HELLO, |_, pkt, iface| {
        iface.set_timeout(WAIT, |state, iface| {
            state.ctx += 1;
            let mut out = iface.get_pkt()?;
            out.set_data_len(2)?;
            out.data_mut().copy_from_slice(&[*iface.connection_id(), b'T']);
            Ok(Step::reply(END, out))
        });
        Ok(Step::reply(BYE, pkt))
    })
    .unwrap()
    .register_function(BYE, |_, _, _| Ok(Step::silent(BYE)))
    .unwrap()
    .register_start_state_id(HELLO, |_, _| Ok(Some(0)))
    .unwrap()
    .register_end_state_id(END)
    .unwrap()
    .register_get_pkt_cb(|| Ok(Buf::new(64)));
    b.build().unwrap()
}

fn later() -> Instant {
    Instant::now() + Duration::from_secs(60)
}

#[test]
fn fires_after_deadline() {
    init_log();
    let m = machine(Config::default());

    m.run_pkt_batch(vec![pkt(1, KIND_HELLO)]);
    assert_eq!(m.armed_timeouts(), 1);

    let out = m.handle_timeout(Instant::now());
    assert!(out.outcomes.is_empty());
    assert!(m.contains(&1));

    let out = m.handle_timeout(later());
    assert_eq!(out.outcomes, vec![Outcome::Finished]);
    assert_eq!(sent(&out.send), vec![vec![1, b'T']]);
    assert!(!m.contains(&1));
    assert_eq!(m.armed_timeouts(), 0);
    assert_eq!(m.stats().timeouts_fired, 1);
}

#[test]
fn packet_cancels_timeout() {
    init_log();
    let m = machine(Config::default());

    m.run_pkt_batch(vec![pkt(1, KIND_HELLO)]);
    m.run_pkt_batch(vec![pkt(1, KIND_OTHER)]);
    assert_eq!(m.armed_timeouts(), 0);

    let out = m.handle_timeout(later());
    assert!(out.outcomes.is_empty());
    assert_eq!(m.current_state(&1), Some(BYE));
}

#[test]
fn remove_cancels_timeout() {
    let m = machine(Config::default());

    m.run_pkt_batch(vec![pkt(1, KIND_HELLO)]);
    m.remove_state(&1);
    assert_eq!(m.armed_timeouts(), 0);
    assert!(m.handle_timeout(later()).outcomes.is_empty());
}

#[test]
fn timeouts_are_bounded() {
    init_log();
    let config = Config::builder().max_timeouts(2).build().unwrap();
    let m = machine(config);

    m.run_pkt_batch((1..=4).map(|c| pkt(c, KIND_HELLO)).collect());
    assert_eq!(m.state_table_len(), 4);
    assert_eq!(m.armed_timeouts(), 2);

    let out = m.handle_timeout(later());
    assert_eq!(out.outcomes.len(), 2);
    assert_eq!(m.state_table_len(), 2);
}

#[test]
fn each_connection_fires_once() {
    let m = machine(Config::default());

    m.run_pkt_batch((1..=3).map(|c| pkt(c, KIND_HELLO)).collect());
    let out = m.handle_timeout(later());
    assert_eq!(out.outcomes, vec![Outcome::Finished; 3]);

    let mut conns: Vec<u8> = out.send.iter().map(|p| p.data()[0]).collect();
    conns.sort_unstable();
    assert_eq!(conns, vec![1, 2, 3]);

    assert!(m.handle_timeout(later()).outcomes.is_empty());
}

#[test]
fn unrepresentable_timeout_keeps_batch() {
    init_log();
    let mut b: Builder<FirstByte, Buf, u32> = StateMachine::builder(FirstByte);
    b.register_function(HELLO, |_, pkt, iface| {
        if *iface.connection_id() == 2 {
            iface.set_timeout(Duration::MAX, |state, _| Ok(Step::silent(state.id)));
        }
        Ok(Step::reply(BYE, pkt))
    })
    .unwrap()
    .register_function(BYE, |_, _, _| Ok(Step::silent(BYE)))
    .unwrap()
    .register_start_state_id(HELLO, |_, _| Ok(Some(0)))
    .unwrap()
    .register_end_state_id(END)
    .unwrap();
    let m = b.build().unwrap();

    let out = m.run_pkt_batch(vec![pkt(1, KIND_HELLO), pkt(2, KIND_HELLO), pkt(3, KIND_HELLO)]);
    assert_eq!(out.outcomes, vec![Outcome::Processed { state: BYE }; 3]);
    assert!(out.outcomes.iter().all(Outcome::is_ok));
    assert_eq!(out.send.len(), 3);
    assert_eq!(m.state_table_len(), 3);
    assert_eq!(m.armed_timeouts(), 0);
}
