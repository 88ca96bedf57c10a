//! Listening socket wrapped in a [`Channel`](crate::channel::Channel),
//! living entirely on the base loop. See spec §4.5.
//!
//! Grounded on `examples/original_source/src/acceptor.cpp`, with the
//! REDESIGN FLAG from spec §9 applied: the source accepts one connection
//! per readiness notification with a `// FIXME loop until no more`
//! comment. This accepts in a loop until `accept4` reports `EAGAIN`,
//! classifying `EMFILE`/`ENFILE` specially so a burst of connects under
//! fd exhaustion doesn't spin-retry.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, Events};
use crate::error::{ReactorError, Result};
use crate::event_loop::{Dispatchable, EventLoop, EventLoopHandle};
use crate::inet_addr::InetAddress;
use crate::sockets::{self, AcceptError};
use crate::timestamp::Timestamp;

pub type NewConnectionCallback = Box<dyn Fn(RawFd, InetAddress) + Send + Sync>;

struct Inner {
    loop_handle: EventLoopHandle,
    fd: RawFd,
    channel: Mutex<Channel>,
    listening: Mutex<bool>,
    new_conn_cb: Mutex<Option<NewConnectionCallback>>,
}

/// Owns the listening socket; must be constructed and driven entirely on
/// its owning loop (the server's base loop). Cheaply `Clone`-able — all
/// clones share the same underlying socket and registration.
#[derive(Clone)]
pub struct Acceptor(Arc<Inner>);

impl Acceptor {
    /// Creates a nonblocking, `SO_REUSEADDR` listening socket bound to
    /// `listen_addr`. Does not yet call `listen(2)` — see
    /// [`Acceptor::listen`].
    pub fn new(loop_handle: EventLoopHandle, listen_addr: InetAddress) -> Result<Acceptor> {
        let fd = sockets::create_nonblocking_socket()?;
        sockets::set_reuse_addr(fd, true).map_err(|source| ReactorError::Bind {
            addr: listen_addr,
            source,
        })?;
        sockets::bind(fd, listen_addr)?;

        Ok(Acceptor(Arc::new(Inner {
            loop_handle,
            fd,
            channel: Mutex::new(Channel::new(fd)),
            listening: Mutex::new(false),
            new_conn_cb: Mutex::new(None),
        })))
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.0.new_conn_cb.lock().unwrap() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        *self.0.listening.lock().unwrap()
    }

    /// The address actually bound, useful when `listen_addr` was
    /// constructed with port `0` and the kernel picked one.
    pub fn local_addr(&self) -> std::io::Result<InetAddress> {
        sockets::local_addr(self.0.fd)
    }

    /// Transitions the socket to `LISTEN` and registers it with the
    /// owning loop. Must run on the base loop.
    pub fn listen(&self) -> std::io::Result<()> {
        self.0.loop_handle.assert_in_loop_thread();
        sockets::listen(self.0.fd).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        *self.0.listening.lock().unwrap() = true;

        {
            let mut channel = self.0.channel.lock().unwrap();
            channel.enable_reading();
        }
        let dispatchable: Arc<dyn Dispatchable> = Arc::new(self.clone());
        EventLoop::with_current(|lp| {
            lp.update_channel(self.0.fd, Events::READABLE, dispatchable);
        });
        Ok(())
    }

    /// Accepts every pending connection (spec §4.5's redesigned,
    /// loop-until-`EAGAIN` behavior) and hands each `(fd, peer_addr)` to
    /// the new-connection callback, or closes it if none is set.
    fn handle_read(&self) {
        self.0.loop_handle.assert_in_loop_thread();
        loop {
            match sockets::accept(self.0.fd) {
                Ok((connfd, peer_addr)) => {
                    let cb = self.0.new_conn_cb.lock().unwrap();
                    match cb.as_ref() {
                        Some(cb) => cb(connfd, peer_addr),
                        None => sockets::close(connfd),
                    }
                }
                Err(AcceptError::WouldBlock) => break,
                Err(AcceptError::FileDescriptorsExhausted) => {
                    log::error!(
                        "Acceptor: fd exhausted accepting on fd={}, backing off until next readiness",
                        self.0.fd
                    );
                    break;
                }
                Err(AcceptError::Transient(e)) => {
                    log::debug!("Acceptor: transient accept error: {e}");
                }
                Err(AcceptError::Other(e)) => {
                    log::warn!("Acceptor: unexpected accept error: {e}");
                    break;
                }
            }
        }
    }
}

impl Dispatchable for Acceptor {
    fn dispatch(&self, recv_time: Timestamp, revents: Events) {
        self.0.channel.lock().unwrap().set_revents(revents);
        let _ = recv_time;
        self.handle_read();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        sockets::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_binds_without_listening() {
        let lp = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(lp.handle(), InetAddress::loopback(0)).unwrap();
        assert!(!acceptor.listening());
    }
}
