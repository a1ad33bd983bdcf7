//! Properties of random packet sequences against a model of the test protocol.

use std::collections::HashMap;

use proptest::prelude::*;

use pktsm::{Config, Error, Outcome, StateId};

use crate::common::*;

const CONNS: u8 = 6;

fn arb_packets() -> impl Strategy<Value = Vec<(u8, u8)>> {
    prop::collection::vec((0..CONNS, prop::sample::select(KINDS.to_vec())), 0..64)
}

/// What the test protocol does, without the engine.
fn model(packets: &[(u8, u8)]) -> (Vec<Outcome>, HashMap<u8, StateId>) {
    let mut live: HashMap<u8, StateId> = HashMap::new();
    let mut outcomes = Vec::new();

    for &(conn, kind) in packets {
        let outcome = match (live.get(&conn).copied(), kind) {
            (None, KIND_BYE) => Outcome::Dropped(Error::NoMatchingState),
            (None, KIND_HELLO) => Outcome::Processed { state: BYE },
            (None, KIND_LIMBO) => Outcome::Processed { state: LIMBO },
            (None, _) => Outcome::Finished,
            (Some(BYE), KIND_BYE) => Outcome::Finished,
            (Some(BYE), KIND_FAIL) => Outcome::Failed(Error::Protocol("bad bye".into())),
            (Some(BYE), _) => Outcome::Processed { state: BYE },
            (Some(s), _) => Outcome::Failed(Error::UnregisteredState(s)),
        };

        match &outcome {
            Outcome::Processed { state } => {
                live.insert(conn, *state);
            }
            Outcome::Finished | Outcome::Failed(Error::Protocol(_)) => {
                live.remove(&conn);
            }
            _ => {}
        }
        outcomes.push(outcome);
    }

    (outcomes, live)
}

fn states(m: &Machine) -> HashMap<u8, StateId> {
    (0..CONNS)
        .filter_map(|c| m.current_state(&c).map(|s| (c, s)))
        .collect()
}

fn to_pkts(packets: &[(u8, u8)]) -> Vec<pktsm::Buf> {
    packets.iter().map(|&(c, k)| pkt(c, k)).collect()
}

proptest! {
    #[test]
    fn batch_follows_model(packets in arb_packets()) {
        let m = machine();
        let out = m.run_pkt_batch(to_pkts(&packets));

        let (outcomes, live) = model(&packets);
        prop_assert_eq!(out.outcomes, outcomes);
        prop_assert_eq!(states(&m), live);
    }

    #[test]
    fn ended_connections_are_gone(packets in arb_packets()) {
        let m = machine();
        let out = m.run_pkt_batch(to_pkts(&packets));

        // The last outcome of each connection decides whether it is live.
        let mut last: HashMap<u8, &Outcome> = HashMap::new();
        for ((conn, _), outcome) in packets.iter().zip(&out.outcomes) {
            last.insert(*conn, outcome);
        }
        for (conn, outcome) in last {
            match outcome {
                Outcome::Finished | Outcome::Failed(Error::Protocol(_)) => {
                    prop_assert!(!m.contains(&conn));
                }
                Outcome::Processed { .. } | Outcome::Failed(Error::UnregisteredState(_)) => {
                    prop_assert!(m.contains(&conn));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn replies_only_from_hello(packets in arb_packets()) {
        let m = machine();
        let out = m.run_pkt_batch(to_pkts(&packets));

        let (outcomes, _) = model(&packets);
        let hellos = packets
            .iter()
            .zip(&outcomes)
            .filter(|((_, k), o)| *k == KIND_HELLO && **o == Outcome::Processed { state: BYE })
            .count();
        // BYE handles a HELLO silently, so only openings reply.
        prop_assert!(out.send.len() <= hellos);
        prop_assert!(out.send.iter().all(|p| kind(p) == b'h'));
    }

    #[test]
    fn split_batches_agree(packets in arb_packets(), split in 0usize..64) {
        let whole = machine();
        let a = whole.run_pkt_batch(to_pkts(&packets));

        let parts = machine();
        let at = split.min(packets.len());
        let mut b = parts.run_pkt_batch(to_pkts(&packets[..at]));
        b.outcomes.extend(parts.run_pkt_batch(to_pkts(&packets[at..])).outcomes);

        prop_assert_eq!(a.outcomes, b.outcomes);
        prop_assert_eq!(states(&whole), states(&parts));
    }

    #[test]
    fn connections_commute(packets in arb_packets()) {
        // Regroup by connection, keeping each connection's own order.
        let mut grouped = packets.clone();
        grouped.sort_by_key(|(c, _)| *c);

        let a = machine();
        let b = machine();
        a.run_pkt_batch(to_pkts(&packets));
        b.run_pkt_batch(to_pkts(&grouped));

        prop_assert_eq!(states(&a), states(&b));
        prop_assert_eq!(a.stats(), b.stats());
    }

    #[test]
    fn parallel_agrees(packets in arb_packets(), workers in 2usize..6) {
        let config = Config::builder().workers(workers).build().unwrap();
        let par = builder(config).build().unwrap();
        let seq = machine();

        let a = seq.run_pkt_batch(to_pkts(&packets));
        let b = par.run_pkt_batch(to_pkts(&packets));

        prop_assert_eq!(a.outcomes, b.outcomes);
        prop_assert_eq!(sent(&a.send), sent(&b.send));
        prop_assert_eq!(states(&seq), states(&par));
    }
}
