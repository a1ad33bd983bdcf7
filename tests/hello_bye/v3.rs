//! Binary Hello/Bye with pooled or heap contexts.

use pktsm::hello_bye::v3;
use pktsm::{Buf, Error, Heap, Outcome, Pool};

use crate::common::*;

#[test]
fn heap_exchange() {
    init_log();
    let server = v3::server::<_, Buf>(server_config(1), Heap).unwrap();
    let client = v3::Client::<_, Buf>::new(client_config(2), Heap).unwrap();

    let hello = client.connect(5, SERVER_IP, 40000, Buf::default()).unwrap();
    let trace = pump(hello.send, |p| server.run_pkt_batch(p), |p| client.run_pkt_batch(p));

    assert_eq!(trace.to_server, vec![1, 1]);
    assert_eq!(trace.client_outcomes.last(), Some(&Outcome::Finished));
    assert_eq!(server.state_table_len(), 0);
    assert_eq!(client.state_table_len(), 0);
}

#[test]
fn pool_exchange_returns_every_slot() {
    init_log();
    let server_pool: Pool<v3::ServerCtx> = Pool::new(8);
    let client_pool: Pool<v3::ClientCtx> = Pool::new(8);
    let server = v3::server::<_, Buf>(server_config(3), server_pool.clone()).unwrap();
    let client = v3::Client::<_, Buf>::new(client_config(4), client_pool.clone()).unwrap();

    let hellos: Vec<Buf> = (0..8)
        .flat_map(|ident| {
            client
                .connect(ident, SERVER_IP, 41000 + ident as u16, Buf::default())
                .unwrap()
                .send
        })
        .collect();
    assert_eq!(client_pool.available(), 0);

    let trace = pump(hellos, |p| server.run_pkt_batch(p), |p| client.run_pkt_batch(p));
    assert_eq!(trace.to_server, vec![8, 8]);

    assert_eq!(server_pool.available(), 8);
    assert_eq!(client_pool.available(), 8);
}

#[test]
fn server_pool_exhaustion() {
    init_log();
    let pool: Pool<v3::ServerCtx> = Pool::new(4);
    let server = v3::server::<_, Buf>(server_config(5), pool.clone()).unwrap();
    let client = v3::Client::<_, Buf>::new(client_config(6), Heap).unwrap();

    let hellos: Vec<Buf> = (0..5)
        .flat_map(|ident| {
            client
                .connect(ident, SERVER_IP, 42000 + ident as u16, Buf::default())
                .unwrap()
                .send
        })
        .collect();

    let out = server.run_pkt_batch(hellos);
    assert!(out.outcomes[..4].iter().all(Outcome::is_ok));
    assert_eq!(
        out.outcomes[4],
        Outcome::Dropped(Error::PoolExhausted { capacity: 4 })
    );
    assert_eq!(out.send.len(), 4);
    assert_eq!(server.stats().pool_exhausted, 1);

    // Finishing the four frees room for the fifth.
    let trace = pump(out.send, |p| client.run_pkt_batch(p), |p| server.run_pkt_batch(p));
    assert_eq!(trace.to_server, vec![4, 4]);
    assert_eq!(pool.available(), 4);

    client.remove_state(&4);
    let hello = client.connect(4, SERVER_IP, 42004, Buf::default()).unwrap();
    let out = server.run_pkt_batch(hello.send);
    assert!(out.outcomes[0].is_ok());
    assert_eq!(pool.available(), 3);
}

#[test]
fn client_pool_exhaustion() {
    let pool: Pool<v3::ClientCtx> = Pool::new(1);
    let client = v3::Client::<_, Buf>::new(client_config(7), pool).unwrap();

    client.connect(1, SERVER_IP, 40000, Buf::default()).unwrap();
    let err = client.connect(2, SERVER_IP, 40001, Buf::default()).unwrap_err();
    assert_eq!(err, Error::PoolExhausted { capacity: 1 });

    client.remove_state(&1);
    assert!(client.connect(2, SERVER_IP, 40001, Buf::default()).is_ok());
}
