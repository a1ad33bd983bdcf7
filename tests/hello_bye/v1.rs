//! Text Hello/Bye keyed by the 5-tuple.

use pktsm::headers::FrameBuilder;
use pktsm::hello_bye::{v1, ClientStates};
use pktsm::{Buf, Error, Outcome};

use crate::common::*;

#[test]
fn full_exchange() {
    init_log();
    let server = v1::server::<Buf>(server_config(1)).unwrap();
    let client = v1::Client::<Buf>::new(client_config(2)).unwrap();

    let hello = client.connect(SERVER_IP, 40000, Buf::default()).unwrap();
    assert_eq!(hello.outcomes, vec![Outcome::Processed { state: ClientStates::BYE }]);
    assert!(payload(&hello.send[0]).starts_with(b"CLIENT HELLO:"));
    assert!(client.contains(&client.connection_id(SERVER_IP, 40000)));

    let trace = pump(
        hello.send,
        |p| server.run_pkt_batch(p),
        |p| client.run_pkt_batch(p),
    );

    assert_eq!(trace.to_server, vec![1, 1]);
    assert_eq!(trace.to_client, vec![1, 1]);
    assert_eq!(trace.server_outcomes.last(), Some(&Outcome::Finished));
    assert_eq!(trace.client_outcomes.last(), Some(&Outcome::Finished));
    assert_eq!(server.state_table_len(), 0);
    assert_eq!(client.state_table_len(), 0);
}

#[test]
fn many_clients_one_batch() {
    init_log();
    let mut config = server_config(3);
    config.engine = workers(4);
    let server = v1::server::<Buf>(config).unwrap();
    let client = v1::Client::<Buf>::new(client_config(4)).unwrap();

    let mut hellos = Vec::new();
    for port in 40000..40010 {
        hellos.extend(client.connect(SERVER_IP, port, Buf::default()).unwrap().send);
    }
    assert_eq!(client.state_table_len(), 10);

    let trace = pump(hellos, |p| server.run_pkt_batch(p), |p| client.run_pkt_batch(p));

    assert_eq!(trace.to_server, vec![10, 10]);
    assert!(trace.server_outcomes.iter().all(Outcome::is_ok));
    assert_eq!(server.stats().finished, 10);
    assert_eq!(client.stats().finished, 10);
    assert_eq!(client.state_table_len(), 0);
}

#[test]
fn same_port_twice_is_refused() {
    let client = v1::Client::<Buf>::new(client_config(5)).unwrap();
    client.connect(SERVER_IP, 40000, Buf::default()).unwrap();
    let err = client.connect(SERVER_IP, 40000, Buf::default()).unwrap_err();
    assert_eq!(err, Error::ConnectionExists);
}

#[test]
fn server_ignores_bye_first() {
    init_log();
    let server = v1::server::<Buf>(server_config(6)).unwrap();

    let c = client_config(7);
    let mut bye = Buf::default();
    FrameBuilder {
        src_mac: c.src_mac,
        dst_mac: c.dst_mac,
        src_ip: c.src_ip,
        dst_ip: SERVER_IP,
        src_port: 40001,
        dst_port: c.dst_port,
    }
    .write(&mut bye, b"CLIENT BYE:1\n")
    .unwrap();

    let out = server.run_pkt_batch(vec![bye]);
    assert_eq!(out.outcomes, vec![Outcome::Finished]);
    assert!(out.send.is_empty());
    assert_eq!(server.state_table_len(), 0);
}

#[test]
fn non_udp_not_identified() {
    let server = v1::server::<Buf>(server_config(8)).unwrap();
    let out = server.run_pkt_batch(vec![Buf::from_slice(&[0; 20])]);
    assert_eq!(out.outcomes, vec![Outcome::Dropped(Error::PacketNotIdentified)]);
}
