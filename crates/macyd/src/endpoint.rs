//! Managed multicast sockets.
//!
//! An Endpoint is either the Receiver (bound to group:port, one per process)
//! or a Sender (bound to one local address on one interface). Each owns a
//! read task that lives exactly as long as the Endpoint: dropping or closing
//! the Endpoint aborts it.
//!
//! The error flag is the only thing the read task and the control task share.
//! Once tripped it stays tripped; the next reconcile closes the Endpoint.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use macy_core::wire::{self, RECV_BUFFER_LEN};
use macy_core::{Settings, Transport};
use macy_services::ReachabilityStore;

use crate::fragment::{self, Fragmentation};
use crate::interfaces::{is_link_local, Candidate};

// ── Error flag ────────────────────────────────────────────────────────────────

/// Sticky error state, written by the read task or a failed transmit and
/// read by the control task. Keeps the first reason.
#[derive(Debug, Default)]
pub struct ErrorFlag {
    reason: OnceLock<String>,
}

impl ErrorFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call set the flag.
    pub fn trip(&self, reason: impl Into<String>) -> bool {
        self.reason.set(reason.into()).is_ok()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    pub fn is_set(&self) -> bool {
        self.reason.get().is_some()
    }
}

// ── Keys and roles ────────────────────────────────────────────────────────────

/// Identity of a Sender: one (interface, address) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SenderKey {
    pub index: u32,
    pub name: String,
    pub addr: IpAddr,
}

impl SenderKey {
    pub fn new(candidate: &Candidate, addr: IpAddr) -> Self {
        Self {
            index: candidate.index,
            name: candidate.name.clone(),
            addr,
        }
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender {}({}) {}", self.index, self.name, self.addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Receiver,
    Sender(SenderKey),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Receiver => f.write_str("receiver"),
            Role::Sender(key) => key.fmt(f),
        }
    }
}

// ── Sender family ─────────────────────────────────────────────────────────────

/// How a Sender reaches the group, fixed when the Sender is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderFamily {
    V4 { dest: SocketAddrV4, local: Ipv4Addr },
    V6 { dest: SocketAddrV6, index: u32 },
}

impl SenderFamily {
    pub fn new(settings: &Settings, key: &SenderKey) -> Result<Self> {
        match (settings.group, key.addr) {
            (IpAddr::V4(group), IpAddr::V4(local)) => Ok(SenderFamily::V4 {
                dest: SocketAddrV4::new(group, settings.port),
                local,
            }),
            (IpAddr::V6(group), IpAddr::V6(_)) => Ok(SenderFamily::V6 {
                dest: SocketAddrV6::new(group, settings.port, 0, key.index),
                index: key.index,
            }),
            _ => bail!("{key}: address family does not match group {}", settings.group),
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            SenderFamily::V4 { .. } => Transport::V4,
            SenderFamily::V6 { .. } => Transport::V6,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        match *self {
            SenderFamily::V4 { dest, .. } => dest.into(),
            SenderFamily::V6 { dest, .. } => dest.into(),
        }
    }

    /// TTL, traffic class and outgoing interface. Each failure is a warning.
    fn configure(&self, socket: &Socket, settings: &Settings, owner: &str) {
        let warn = |what: &str, e: std::io::Error| {
            tracing::warn!(socket = owner, option = what, error = %e, "socket option failed");
        };
        match self {
            SenderFamily::V4 { local, .. } => {
                if let Err(e) = socket.set_multicast_ttl_v4(settings.ttl) {
                    warn("IP_MULTICAST_TTL", e);
                }
                if let Err(e) = socket.set_tos(settings.traffic_class()) {
                    warn("IP_TOS", e);
                }
                if let Err(e) = socket.set_multicast_if_v4(local) {
                    warn("IP_MULTICAST_IF", e);
                }
            }
            SenderFamily::V6 { index, .. } => {
                if let Err(e) = socket.set_multicast_hops_v6(settings.ttl) {
                    warn("IPV6_MULTICAST_HOPS", e);
                }
                if let Err(e) = socket.set_tclass_v6(settings.traffic_class()) {
                    warn("IPV6_TCLASS", e);
                }
                if let Err(e) = socket.set_multicast_if_v6(*index) {
                    warn("IPV6_MULTICAST_IF", e);
                }
            }
        }
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

pub struct Endpoint {
    id: u64,
    role: Role,
    local: SocketAddr,
    socket: Arc<UdpSocket>,
    flag: Arc<ErrorFlag>,
    family: Option<SenderFamily>,
    task: JoinHandle<()>,
}

impl Endpoint {
    /// Bind the Receiver to the group address itself, so several instances
    /// on one host can each receive, and start its read task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn receiver(id: u64, settings: &Settings, store: ReachabilityStore) -> Result<Self> {
        let group = settings.group_addr();
        let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
            .context("socket()")?;
        socket.set_reuse_address(true).context("SO_REUSEADDR")?;
        socket.set_reuse_port(true).context("SO_REUSEPORT")?;
        if settings.transport == Transport::V6 {
            socket.set_only_v6(true).context("IPV6_V6ONLY")?;
        }
        socket.set_nonblocking(true).context("set_nonblocking")?;
        socket
            .bind(&group.into())
            .with_context(|| format!("bind({group})"))?;

        let looped = match settings.transport {
            Transport::V4 => socket.set_multicast_loop_v4(true),
            Transport::V6 => socket.set_multicast_loop_v6(true),
        };
        if let Err(e) = looped {
            tracing::warn!(error = %e, "receiver: failed to enable multicast loopback");
        }

        let local = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(group);
        let socket = Arc::new(
            UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?,
        );
        let flag = Arc::new(ErrorFlag::new());
        let task = tokio::spawn(receive_reports(socket.clone(), flag.clone(), store));

        Ok(Self {
            id,
            role: Role::Receiver,
            local,
            socket,
            flag,
            family: None,
            task,
        })
    }

    /// Bind a Sender to one local address and start its read task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn sender(
        id: u64,
        key: SenderKey,
        settings: &Settings,
        frag: &dyn Fragmentation,
    ) -> Result<Self> {
        let family = SenderFamily::new(settings, &key)?;
        let owner = key.to_string();

        let bind: SocketAddr = match key.addr {
            IpAddr::V4(addr) => SocketAddrV4::new(addr, 0).into(),
            IpAddr::V6(addr) => {
                let scope = if is_link_local(&key.addr) { key.index } else { 0 };
                SocketAddrV6::new(addr, 0, 0, scope).into()
            }
        };

        let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
            .context("socket()")?;
        if family.transport() == Transport::V6 {
            socket.set_only_v6(true).context("IPV6_V6ONLY")?;
        }
        socket.set_nonblocking(true).context("set_nonblocking")?;
        socket
            .bind(&bind.into())
            .with_context(|| format!("bind({bind})"))?;

        fragment::apply(
            frag,
            socket.as_raw_fd(),
            family.transport(),
            settings.fragments,
            &owner,
        );
        family.configure(&socket, settings, &owner);

        let local = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(bind);
        let socket = Arc::new(
            UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?,
        );
        let flag = Arc::new(ErrorFlag::new());
        let task = tokio::spawn(drain_unexpected(socket.clone(), flag.clone(), owner));

        Ok(Self {
            id,
            role: Role::Sender(key),
            local,
            socket,
            flag,
            family: Some(family),
            task,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn flag(&self) -> &ErrorFlag {
        &self.flag
    }

    /// Ask the kernel to deliver the group on this interface.
    ///
    /// There is no way to ask whether a join is already in effect, so callers
    /// re-issue it every cycle and treat errors as expected.
    pub fn join(&self, group: IpAddr, candidate: &Candidate) -> std::io::Result<()> {
        match group {
            IpAddr::V4(group) => {
                let local = candidate
                    .addrs
                    .iter()
                    .find_map(|a| match a {
                        IpAddr::V4(v4) => Some(*v4),
                        IpAddr::V6(_) => None,
                    })
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                self.socket.join_multicast_v4(group, local)
            }
            IpAddr::V6(group) => self.socket.join_multicast_v6(&group, candidate.index),
        }
    }

    /// Fire-and-forget send to the group. Message-too-large is logged only;
    /// any other failure trips the error flag. Receivers ignore this.
    ///
    /// Sends on the raw non-blocking socket. tokio's `try_send_to` reports
    /// `WouldBlock` until the reactor has polled the socket writable.
    pub fn transmit(&self, datagram: &[u8]) {
        let Some(family) = &self.family else { return };
        let dest = family.destination();

        match SockRef::from(&*self.socket).send_to(datagram, &dest.into()) {
            Ok(n) => tracing::trace!(socket = %self.role, bytes = n, "report sent"),
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                tracing::warn!(socket = %self.role, bytes = datagram.len(), error = %e, "report too large");
            }
            Err(e) => {
                tracing::warn!(socket = %self.role, error = %e, "send failed");
                self.flag.trip(e.to_string());
            }
        }
    }

    /// Stop the read task. The socket closes once the task has released its
    /// handle and `self` is dropped.
    pub fn close(self) {
        self.task.abort();
        tracing::debug!(socket = %self.role, id = self.id, "closing");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("local", &self.local)
            .field("error", &self.flag.reason())
            .finish()
    }
}

// ── Read tasks ────────────────────────────────────────────────────────────────

/// Receiver read loop: decode, then record under the arrival time.
async fn receive_reports(socket: Arc<UdpSocket>, flag: Arc<ErrorFlag>, store: ReachabilityStore) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "receiver: recv_from failed");
                flag.trip(e.to_string());
                return;
            }
        };
        let at = Instant::now();

        match wire::decode(&buf[..len]) {
            Ok(report) => {
                tracing::trace!(
                    from = %from,
                    host = %report.host,
                    heard = report.heard.len(),
                    "report received"
                );
                store.record(report, from.ip(), at);
            }
            Err(e) => tracing::debug!(from = %from, bytes = len, error = %e, "dropping datagram"),
        }
    }
}

/// Sender read loop. Senders never expect traffic.
async fn drain_unexpected(socket: Arc<UdpSocket>, flag: Arc<ErrorFlag>, owner: String) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => tracing::warn!(
                socket = %owner,
                from = %from,
                data = %hex::encode(&buf[..len]),
                "unexpected datagram"
            ),
            Err(e) => {
                tracing::warn!(socket = %owner, error = %e, "recv_from failed");
                flag.trip(e.to_string());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macy_core::{Codec, MacyConfig, Report};
    use std::time::Duration;

    fn loopback_settings() -> Settings {
        MacyConfig::default().validate("test").unwrap()
    }

    fn loopback_key() -> SenderKey {
        SenderKey {
            index: 1,
            name: "lo".into(),
            addr: "127.0.0.1".parse().unwrap(),
        }
    }

    #[test]
    fn error_flag_keeps_first_reason() {
        let flag = ErrorFlag::new();
        assert!(!flag.is_set());
        assert!(flag.trip("first"));
        assert!(!flag.trip("second"));
        assert!(flag.is_set());
        assert_eq!(flag.reason(), Some("first"));
    }

    #[test]
    fn sender_family_follows_group() {
        let settings = loopback_settings();
        let family = SenderFamily::new(&settings, &loopback_key()).unwrap();
        assert_eq!(family.transport(), Transport::V4);
        assert_eq!(
            family.destination(),
            "239.239.239.239:23923".parse::<SocketAddr>().unwrap()
        );

        let v6_key = SenderKey {
            index: 3,
            name: "eth0".into(),
            addr: "2001:db8::1".parse().unwrap(),
        };
        assert!(SenderFamily::new(&settings, &v6_key).is_err());

        let mut config = MacyConfig::default();
        config.probe.group = "ff05::1:3".into();
        let v6 = config.validate("test").unwrap();
        match SenderFamily::new(&v6, &v6_key).unwrap() {
            SenderFamily::V6 { dest, index } => {
                assert_eq!(index, 3);
                assert_eq!(dest.scope_id(), 3);
                assert_eq!(dest.port(), 23923);
            }
            other => panic!("unexpected family {other:?}"),
        }
    }

    #[test]
    fn sender_key_display() {
        assert_eq!(loopback_key().to_string(), "sender 1(lo) 127.0.0.1");
    }

    #[tokio::test]
    async fn sender_binds_to_its_address() {
        let settings = loopback_settings();
        let sender = Endpoint::sender(
            7,
            loopback_key(),
            &settings,
            &crate::fragment::PlatformFragmentation,
        )
        .unwrap();
        assert_eq!(sender.id(), 7);
        assert_eq!(sender.local_addr().ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_ne!(sender.local_addr().port(), 0);
        assert!(!sender.flag().is_set());
    }

    fn loopback_sender(id: u64) -> Endpoint {
        Endpoint::sender(
            id,
            loopback_key(),
            &loopback_settings(),
            &crate::fragment::PlatformFragmentation,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn first_transmit_on_new_sender_succeeds() {
        let sender = loopback_sender(1);
        let bytes = Codec::new(None).encode(&Report::new("test")).unwrap();

        sender.transmit(&bytes);
        match sender.flag().reason() {
            None => {}
            Some(reason) if reason.contains("unreachable") => {
                eprintln!("SKIP: no multicast route from loopback: {reason}");
            }
            Some(reason) => panic!("transmit tripped the flag: {reason}"),
        }
    }

    #[tokio::test]
    async fn oversized_transmit_leaves_flag_clear() {
        let sender = loopback_sender(2);
        // Past the UDP length field, so the kernel refuses it before routing.
        let datagram = vec![0u8; 70_000];

        sender.transmit(&datagram);
        assert!(!sender.flag().is_set(), "{:?}", sender.flag().reason());
    }

    #[tokio::test]
    async fn close_releases_socket() {
        let sender = loopback_sender(3);
        let socket = Arc::downgrade(&sender.socket);
        sender.close();

        for _ in 0..50 {
            if socket.upgrade().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("read task still holds the socket");
    }

    #[tokio::test]
    async fn receiver_records_decoded_reports() {
        let mut config = MacyConfig::default();
        config.probe.port = 30000 + (std::process::id() % 20000);
        let settings = config.validate("test").unwrap();
        let store = ReachabilityStore::new();

        let receiver = match Endpoint::receiver(1, &settings, store.clone()) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("SKIP: cannot bind receiver to group: {e:#}");
                return;
            }
        };

        let lo = Candidate {
            index: 1,
            name: "lo".into(),
            addrs: vec!["127.0.0.1".parse().unwrap()],
        };
        let _ = receiver.join(settings.group, &lo);

        let probe = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        probe
            .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
            .unwrap();
        let _ = probe.set_multicast_if_v4(&Ipv4Addr::LOCALHOST);
        let _ = probe.set_multicast_loop_v4(true);

        let report = Report::new("peer").with_heard("192.0.2.20", Duration::from_secs(5));
        let bytes = Codec::new(None).encode(&report).unwrap();
        if probe.send_to(&bytes, &settings.group_addr().into()).is_err() {
            eprintln!("SKIP: no route to the group");
            return;
        }

        for _ in 0..50 {
            if store.heard_host("peer").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if store.heard_host("peer").is_none() {
            eprintln!("SKIP: multicast not delivered on this host");
            return;
        }
        assert_eq!(
            store.reported_by("peer").unwrap()["192.0.2.20"],
            Duration::from_secs(5)
        );
    }
}
