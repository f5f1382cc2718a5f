//! Don't-fragment control for sender sockets.
//!
//! Linux has no per-socket DF flag; probe-mode path MTU discovery sets DF on
//! every datagram without ever lowering the cached MTU. The BSDs expose the
//! flag directly. Everything else reports `Unsupported`.

use std::io;
use std::os::fd::RawFd;

use macy_core::Transport;

pub trait Fragmentation: Send + Sync {
    fn set_do_not_fragment(&self, fd: RawFd, transport: Transport) -> io::Result<()>;
    fn clear_do_not_fragment(&self, fd: RawFd, transport: Transport) -> io::Result<()>;
}

/// The implementation for the build target.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformFragmentation;

#[cfg(target_os = "linux")]
impl Fragmentation for PlatformFragmentation {
    fn set_do_not_fragment(&self, fd: RawFd, transport: Transport) -> io::Result<()> {
        match transport {
            Transport::V4 => set_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_PROBE),
            Transport::V6 => set_int(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_MTU_DISCOVER,
                libc::IPV6_PMTUDISC_PROBE,
            ),
        }
    }

    fn clear_do_not_fragment(&self, fd: RawFd, transport: Transport) -> io::Result<()> {
        match transport {
            Transport::V4 => set_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DONT),
            Transport::V6 => set_int(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_MTU_DISCOVER,
                libc::IPV6_PMTUDISC_DONT,
            ),
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod bsd {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const IP_DONTFRAG: libc::c_int = 28;
    #[cfg(target_os = "freebsd")]
    pub const IP_DONTFRAG: libc::c_int = 67;
    pub const IPV6_DONTFRAG: libc::c_int = 62;
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
impl PlatformFragmentation {
    fn dont_frag(fd: RawFd, transport: Transport, on: libc::c_int) -> io::Result<()> {
        match transport {
            Transport::V4 => set_int(fd, libc::IPPROTO_IP, bsd::IP_DONTFRAG, on),
            Transport::V6 => set_int(fd, libc::IPPROTO_IPV6, bsd::IPV6_DONTFRAG, on),
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
impl Fragmentation for PlatformFragmentation {
    fn set_do_not_fragment(&self, fd: RawFd, transport: Transport) -> io::Result<()> {
        Self::dont_frag(fd, transport, 1)
    }

    fn clear_do_not_fragment(&self, fd: RawFd, transport: Transport) -> io::Result<()> {
        Self::dont_frag(fd, transport, 0)
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
impl Fragmentation for PlatformFragmentation {
    fn set_do_not_fragment(&self, _fd: RawFd, _transport: Transport) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn clear_do_not_fragment(&self, _fd: RawFd, _transport: Transport) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// Clear DF when fragments are allowed, set it otherwise. Failure leaves the
/// socket with the OS default and is only logged.
pub fn apply(
    frag: &dyn Fragmentation,
    fd: RawFd,
    transport: Transport,
    allow_fragments: bool,
    owner: &str,
) {
    let result = if allow_fragments {
        frag.clear_do_not_fragment(fd, transport)
    } else {
        frag.set_do_not_fragment(fd, transport)
    };
    if let Err(e) = result {
        tracing::warn!(
            socket = owner,
            allow_fragments,
            error = %e,
            "failed to set fragmentation policy"
        );
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
))]
fn set_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: `value` outlives the call and the length matches its type.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
