use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use macy_core::wire::decode;
use macy_core::{Codec, Report};
use macy_services::ReachabilityStore;
use tokio::net::UdpSocket;

use crate::*;

const GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

/// Bind to the group on an ephemeral port and join it on loopback.
async fn group_member() -> Option<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.join_multicast_v4(GROUP, Ipv4Addr::LOCALHOST).ok()?;
    socket.set_multicast_loop_v4(true).ok()?;
    Some(socket)
}

/// A report sent to the group over loopback reaches a member.
#[tokio::test]
async fn test_report_over_multicast_loopback() {
    let Some(member) = group_member().await else {
        eprintln!("SKIP: cannot join multicast group on loopback");
        return;
    };
    let port = member.local_addr().unwrap().port();

    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    if sender.set_multicast_ttl_v4(1).is_err() {
        eprintln!("SKIP: cannot set multicast TTL");
        return;
    }
    let report = Report::new("mc").with_heard("10.9.9.9", Duration::from_secs(1));
    let datagram = Codec::new(None).encode(&report).unwrap();

    if sender
        .send_to(&datagram, SocketAddr::from((GROUP, port)))
        .await
        .is_err()
    {
        eprintln!("SKIP: no multicast route on loopback");
        return;
    }

    let (data, from) = match recv_datagram(&member).await {
        Ok(got) => got,
        Err(_) => {
            eprintln!("SKIP: multicast datagram not looped back");
            return;
        }
    };

    let store = ReachabilityStore::new();
    store.record(decode(&data).unwrap(), from.ip(), Instant::now());
    assert_eq!(store.host_count(), 1);
    assert_eq!(store.reported_by("mc").unwrap()["10.9.9.9"], Duration::from_secs(1));
}
