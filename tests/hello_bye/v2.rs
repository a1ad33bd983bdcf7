//! Binary Hello/Bye, one context type per state.

use pktsm::hello_bye::{v2, ClientStates, Msg, ServerStates, MSG_BYE, MSG_HELLO, ROLE_CLIENT, ROLE_SERVER};
use pktsm::{Buf, Outcome};

use crate::common::*;

fn msg(pkt: &Buf) -> Msg {
    Msg::parse(&payload(pkt)).unwrap().1
}

#[test]
fn full_exchange() {
    init_log();
    let server = v2::server::<Buf>(server_config(1)).unwrap();
    let client = v2::Client::<Buf>::new(client_config(2)).unwrap();

    let hello = client.connect(77, SERVER_IP, 40000, Buf::default()).unwrap();
    let first = msg(&hello.send[0]);
    assert_eq!(first.ident, 77);
    assert!(first.is(ROLE_CLIENT, MSG_HELLO));

    // Step the exchange by hand to look at every message.
    let out = server.run_pkt_batch(hello.send);
    assert_eq!(out.outcomes, vec![Outcome::Processed { state: ServerStates::BYE }]);
    let server_hello = msg(&out.send[0]);
    assert!(server_hello.is(ROLE_SERVER, MSG_HELLO));

    let out = client.run_pkt_batch(out.send);
    assert_eq!(out.outcomes, vec![Outcome::Processed { state: ClientStates::RECV_BYE }]);
    let client_bye = msg(&out.send[0]);
    assert!(client_bye.is(ROLE_CLIENT, MSG_BYE));
    assert_eq!(client_bye.cookie, server_hello.cookie);

    let out = server.run_pkt_batch(out.send);
    assert_eq!(out.outcomes, vec![Outcome::Finished]);
    let server_bye = msg(&out.send[0]);
    assert!(server_bye.is(ROLE_SERVER, MSG_BYE));
    assert_eq!(server_bye.cookie, first.cookie);

    let out = client.run_pkt_batch(out.send);
    assert_eq!(out.outcomes, vec![Outcome::Finished]);
    assert!(out.send.is_empty());
    assert_eq!(client.state_table_len(), 0);
    assert_eq!(server.state_table_len(), 0);
}

#[test]
fn idents_are_independent() {
    init_log();
    let mut config = server_config(3);
    config.engine = workers(3);
    let server = v2::server::<Buf>(config).unwrap();
    let client = v2::Client::<Buf>::new(client_config(4)).unwrap();

    let hellos: Vec<Buf> = (1..=20)
        .flat_map(|ident| {
            client
                .connect(ident, SERVER_IP, 40000 + ident as u16, Buf::default())
                .unwrap()
                .send
        })
        .collect();

    let trace = pump(hellos, |p| server.run_pkt_batch(p), |p| client.run_pkt_batch(p));
    assert_eq!(trace.to_server, vec![20, 20]);
    assert_eq!(trace.to_client, vec![20, 20]);
    assert_eq!(server.stats().finished, 20);
    assert_eq!(client.stats().finished, 20);
}

#[test]
fn server_reply_to_unknown_ident_is_dropped() {
    init_log();
    let server = v2::server::<Buf>(server_config(5)).unwrap();
    let client = v2::Client::<Buf>::new(client_config(6)).unwrap();
    let other = v2::Client::<Buf>::new(client_config(7)).unwrap();

    let hello = other.connect(9, SERVER_IP, 40000, Buf::default()).unwrap();
    let out = server.run_pkt_batch(hello.send);

    let out = client.run_pkt_batch(out.send);
    assert_eq!(out.outcomes, vec![Outcome::Dropped(pktsm::Error::NoMatchingState)]);
}

#[test]
fn seeded_cookies_repeat() {
    let a = v2::Client::<Buf>::new(client_config(11)).unwrap();
    let b = v2::Client::<Buf>::new(client_config(11)).unwrap();

    let x = a.connect(1, SERVER_IP, 40000, Buf::default()).unwrap();
    let y = b.connect(1, SERVER_IP, 40000, Buf::default()).unwrap();
    assert_eq!(msg(&x.send[0]).cookie, msg(&y.send[0]).cookie);
}
