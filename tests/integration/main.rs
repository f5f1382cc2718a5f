//! macy integration test harness.
//!
//! Tests here push real datagrams through loopback sockets and run them
//! through the codec and the reachability store the way the daemon does.
//!
//!   cargo test --test integration
//!
//! Tests that need multicast on loopback print SKIP and return when the
//! host does not allow it (containers without a multicast route, mostly).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use macy_core::wire::RECV_BUFFER_LEN;

mod exchange;
mod multicast;
mod sizing;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// How long a test waits for a datagram before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind a UDP socket on an ephemeral loopback port.
pub async fn loopback_socket() -> Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(LOOPBACK, 0))
        .await
        .context("failed to bind loopback socket")
}

/// Receive one datagram, or fail after `RECV_TIMEOUT`.
pub async fn recv_datagram(socket: &UdpSocket) -> Result<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    let (n, from) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("timed out waiting for datagram")??;
    buf.truncate(n);
    Ok((buf, from))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_loopback_sockets_talk() {
    let a = loopback_socket().await.unwrap();
    let b = loopback_socket().await.unwrap();

    a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
    let (data, from) = recv_datagram(&b).await.unwrap();

    assert_eq!(data, b"ping");
    assert_eq!(from, a.local_addr().unwrap());
}
