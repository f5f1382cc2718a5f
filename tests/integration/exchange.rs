use std::time::{Duration, Instant};

use macy_core::wire::decode;
use macy_core::{Codec, Report};
use macy_services::{ReachabilityMatrix, ReachabilityStore};

use crate::*;

/// A report from host A arrives at B; B's store and matrix reflect it.
#[tokio::test]
async fn test_report_exchange_updates_matrix() {
    let a = loopback_socket().await.unwrap();
    let b = loopback_socket().await.unwrap();
    let codec = Codec::new(None);

    let report = Report::new("A").with_heard("192.0.2.20", Duration::from_secs(5));
    let datagram = codec.encode(&report).unwrap();
    a.send_to(&datagram, b.local_addr().unwrap()).await.unwrap();

    let (data, from) = recv_datagram(&b).await.unwrap();
    let received = decode(&data).unwrap();
    assert_eq!(received, report);

    let store = ReachabilityStore::new();
    let arrived = Instant::now();
    store.record(received, from.ip(), arrived);

    assert_eq!(store.heard_host("A"), Some(arrived));
    assert_eq!(store.heard_ip(&LOOPBACK), Some(arrived));

    let matrix = ReachabilityMatrix::build(
        &store.snapshot(),
        "B",
        [LOOPBACK],
        arrived + Duration::from_secs(2),
    );
    assert_eq!(matrix.hosts, vec!["A", "B"]);
    assert_eq!(
        matrix.cell("192.0.2.20", "A"),
        Some(Duration::from_secs(7))
    );
    assert_eq!(matrix.cell("127.0.0.1", "B"), Some(Duration::from_secs(2)));
    assert_eq!(matrix.cell("192.0.2.20", "B"), None);
}

/// Two hosts probing each other: each one's next report carries what it heard.
#[tokio::test]
async fn test_reports_echo_heard_sources() {
    let a = loopback_socket().await.unwrap();
    let b = loopback_socket().await.unwrap();
    let codec = Codec::new(None);
    let store_a = ReachabilityStore::new();
    let store_b = ReachabilityStore::new();

    // A → B
    let hello = codec.encode(&store_a.build_report("A", Instant::now())).unwrap();
    a.send_to(&hello, b.local_addr().unwrap()).await.unwrap();
    let (data, from) = recv_datagram(&b).await.unwrap();
    store_b.record(decode(&data).unwrap(), from.ip(), Instant::now());

    // B → A, now carrying B's view of A
    let reply = codec.encode(&store_b.build_report("B", Instant::now())).unwrap();
    b.send_to(&reply, a.local_addr().unwrap()).await.unwrap();
    let (data, from) = recv_datagram(&a).await.unwrap();
    let from_b = decode(&data).unwrap();

    assert_eq!(from_b.host, "B");
    assert!(from_b.heard.contains_key("127.0.0.1"), "{:?}", from_b.heard);

    store_a.record(from_b, from.ip(), Instant::now());
    let seen_by_b = store_a.reported_by("B").unwrap();
    assert!(seen_by_b["127.0.0.1"] < RECV_TIMEOUT);
}

/// Garbage on the wire is rejected without touching the store.
#[tokio::test]
async fn test_garbage_datagram_is_rejected() {
    let a = loopback_socket().await.unwrap();
    let b = loopback_socket().await.unwrap();

    a.send_to(b"not a report", b.local_addr().unwrap()).await.unwrap();
    let (data, _) = recv_datagram(&b).await.unwrap();

    assert!(decode(&data).is_err());
}
