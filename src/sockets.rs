//! Raw, non-blocking socket plumbing: creation, bind, listen, accept,
//! and the handful of socket options this crate cares about. See spec
//! §6.5. Grounded on `examples/original_source/src/include/socketsops.h`
//! and the syscall usage style of `examples/tokio-rs-mio/src/sys/unix`.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::error::ReactorError;
use crate::inet_addr::InetAddress;

/// Creates a non-blocking, close-on-exec TCP socket. Fatal if it
/// fails — there's no reasonable fallback for "the kernel won't give
/// us a socket."
pub fn create_nonblocking_socket() -> Result<RawFd, ReactorError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(ReactorError::SocketInit(io::Error::last_os_error()));
    }
    Ok(fd)
}

/// Binds `fd` to `addr`. Fatal — this always happens once, at server
/// startup, and there's no useful way to continue without it.
pub fn bind(fd: RawFd, addr: InetAddress) -> Result<(), ReactorError> {
    let sockaddr = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(ReactorError::Bind {
            addr,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// The standard backlog muduo uses; large enough that a burst of
/// connects doesn't get refused under normal load.
const LISTEN_BACKLOG: i32 = 1024;

pub fn listen(fd: RawFd) -> Result<(), ReactorError> {
    let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
    if rc < 0 {
        return Err(ReactorError::Listen(io::Error::last_os_error()));
    }
    Ok(())
}

/// Classification of an `accept4` failure so the caller can decide
/// whether it's "try again later" or something worth logging loudly.
pub enum AcceptError {
    /// No connection waiting (`EAGAIN`/`EWOULDBLOCK`). Not an error —
    /// stop accepting for this readiness notification.
    WouldBlock,
    /// Process-wide or system-wide fd exhaustion (`EMFILE`/`ENFILE`).
    /// The REDESIGN FLAG fix: don't busy-loop on this.
    FileDescriptorsExhausted,
    /// Transient per-connection failures a production server should
    /// shrug off and keep accepting (`ECONNABORTED`, `EINTR`,
    /// `EPROTO`, `EPERM`).
    Transient(io::Error),
    /// Anything else — unexpected and worth surfacing.
    Other(io::Error),
}

/// Accepts one connection. Returns the new fd (already non-blocking,
/// close-on-exec) and the peer's address.
pub fn accept(listen_fd: RawFd) -> Result<(RawFd, InetAddress), AcceptError> {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut sockaddr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if fd >= 0 {
        return Ok((fd, from_sockaddr_in(&sockaddr)));
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Err(AcceptError::WouldBlock),
        Some(libc::EMFILE) | Some(libc::ENFILE) => Err(AcceptError::FileDescriptorsExhausted),
        Some(libc::ECONNABORTED) | Some(libc::EINTR) | Some(libc::EPROTO) | Some(libc::EPERM) => {
            Err(AcceptError::Transient(err))
        }
        _ => Err(AcceptError::Other(err)),
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Writes as much of `data` as the nonblocking socket accepts in one
/// syscall. `Ok(0)` and a `WouldBlock` error are both "nothing written
/// right now" — callers distinguish by matching on the error.
pub fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Half-closes the write side, leaving reads working — used to
/// implement `TcpConnection::shutdown`.
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // The peer having already gone away isn't a failure worth
        // surfacing to the caller of `shutdown`.
        if err.raw_os_error() != Some(libc::ENOTCONN) {
            return Err(err);
        }
    }
    Ok(())
}

pub fn set_tcp_no_delay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

fn set_bool_option(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let value: libc::c_int = if on { 1 } else { 0 };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads and clears `SO_ERROR`, the idiom for finding out why a
/// non-blocking `connect` or a readiness-triggered socket failed.
pub fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

pub fn local_addr(fd: RawFd) -> io::Result<InetAddress> {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut sockaddr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr_in(&sockaddr))
}

pub fn peer_addr(fd: RawFd) -> io::Result<InetAddress> {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(
            fd,
            &mut sockaddr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr_in(&sockaddr))
}

fn to_sockaddr_in(addr: InetAddress) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "ios"))]
        sin_len: 0,
    }
}

fn from_sockaddr_in(sockaddr: &libc::sockaddr_in) -> InetAddress {
    let octets = sockaddr.sin_addr.s_addr.to_ne_bytes();
    InetAddress::with_ip(
        std::net::Ipv4Addr::from(octets),
        u16::from_be(sockaddr.sin_port),
    )
}
