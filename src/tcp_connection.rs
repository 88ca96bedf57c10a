//! Per-connection state machine: owns a socket, a `Channel`, input/output
//! `Buffer`s, and the user-visible callbacks. See spec §4.7.
//!
//! Grounded on `examples/original_source/src/tcp_connection.cpp` and its
//! header. The source uses `shared_from_this()` so posted tasks and the
//! server's connection map can each hold an independent strong reference
//! that outlives any single dispatch; here that's simply `Arc<Inner>`.
//!
//! `Dispatchable::dispatch` reimplements `Channel`'s fixed readiness
//! order (spec §4.2) directly against `Inner`'s handlers instead of
//! routing through `Channel::handle_events`, because the latter would
//! need to hold the channel's `Mutex` guard for the whole call — and a
//! handler like `handle_close` needs that same lock (to call
//! `disable_all`), which would deadlock against itself.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::callbacks::{CloseCallback, ConnectionCallback, MessageCallback, WriteCompleteCallback};
use crate::channel::{Channel, Events};
use crate::event_loop::{Dispatchable, EventLoop, EventLoopHandle};
use crate::inet_addr::InetAddress;
use crate::sockets;
use crate::timestamp::Timestamp;

/// Lifecycle state. Transitions are spelled out in spec §4.7; every
/// mutation happens on the connection's owning loop (invariant 3, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

struct Inner {
    loop_handle: EventLoopHandle,
    name: String,
    state: AtomicU8,
    fd: RawFd,
    channel: Mutex<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

/// A cheap, `Clone`-able handle to a connection. All clones refer to the
/// same underlying socket and state; this is the type user callbacks and
/// the server's connection map both hold (spec's "shared by user code
/// and internals" data model note).
#[derive(Clone)]
pub struct TcpConnection(Arc<Inner>);

impl TcpConnection {
    /// Constructs a connection in the `Connecting` state around an
    /// already-accepted `fd`. Does not yet register the channel with the
    /// loop — that happens in [`TcpConnection::establish_connection`].
    pub(crate) fn new(
        loop_handle: EventLoopHandle,
        name: String,
        fd: RawFd,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> TcpConnection {
        TcpConnection(Arc::new(Inner {
            loop_handle,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            fd,
            channel: Mutex::new(Channel::new(fd)),
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.0.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.0.peer_addr
    }

    pub fn state(&self) -> State {
        State::from_u8(self.0.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    /// `true` once `establish_connection` has run and before
    /// `destroy_connection` has; mirrors the source's
    /// `state_ == kConnected` check surfaced to user callbacks.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn loop_handle(&self) -> &EventLoopHandle {
        &self.0.loop_handle
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.0.connection_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_message_callback(&self, cb: MessageCallback) {
        *self.0.message_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.0.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.0.close_cb.lock().unwrap() = Some(cb);
    }

    /// Enables read interest and registers `fd` with the owning loop's
    /// poller, with this connection itself (via `Dispatchable`) as the
    /// thing notified on readiness. Must run on the owning loop.
    pub(crate) fn establish_connection(&self) {
        self.0.loop_handle.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);

        self.0.channel.lock().unwrap().enable_reading();
        self.set_state(State::Connected);

        let dispatchable: Arc<dyn Dispatchable> = Arc::new(self.clone());
        EventLoop::with_current(|lp| {
            lp.update_channel(self.0.fd, Events::READABLE, dispatchable);
        });

        self.fire_connection_callback();
    }

    fn fire_connection_callback(&self) {
        if let Some(cb) = self.0.connection_cb.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    /// Thread-safe: sends `message`, buffering whatever the socket won't
    /// take immediately. No-op once the connection is no longer
    /// `Connected`.
    pub fn send(&self, message: impl Into<Vec<u8>>) {
        if self.state() != State::Connected {
            return;
        }
        let message = message.into();
        let this = self.clone();
        if self.0.loop_handle.is_in_loop_thread() {
            this.send_in_loop(&message);
        } else {
            self.0.loop_handle.run_in_loop(move || this.send_in_loop(&message));
        }
    }

    fn send_in_loop(&self, message: &[u8]) {
        self.0.loop_handle.assert_in_loop_thread();
        let mut nwritten = 0usize;
        let mut fault = false;

        let already_writing = self.0.channel.lock().unwrap().is_writing();
        let output_empty = self.0.output_buffer.lock().unwrap().readable_bytes() == 0;

        if !already_writing && output_empty {
            match sockets::write_fd(self.0.fd, message) {
                Ok(n) => {
                    nwritten = n;
                    if n == message.len() {
                        if let Some(cb) = self.0.write_complete_cb.lock().unwrap().clone() {
                            let this = self.clone();
                            self.0.loop_handle.queue_in_loop(move || cb(&this));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        log::warn!("TcpConnection::send_in_loop [{}]: {e}", self.0.name);
                        if e.raw_os_error() == Some(libc::EPIPE) || e.raw_os_error() == Some(libc::ECONNRESET) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && nwritten < message.len() {
            let remaining = &message[nwritten..];
            self.0.output_buffer.lock().unwrap().append(remaining);
            let mut channel = self.0.channel.lock().unwrap();
            if !channel.is_writing() {
                channel.enable_writing();
                drop(channel);
                let dispatchable: Arc<dyn Dispatchable> = Arc::new(self.clone());
                EventLoop::with_current(|lp| {
                    lp.update_channel(self.0.fd, Events::READABLE | Events::WRITABLE, dispatchable);
                });
            }
        }
    }

    /// Half-closes the write side once the output buffer has drained.
    /// Thread-safe; no-op unless currently `Connected`.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let this = self.clone();
            self.0.loop_handle.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.0.loop_handle.assert_in_loop_thread();
        if !self.0.channel.lock().unwrap().is_writing() {
            if let Err(e) = sockets::shutdown_write(self.0.fd) {
                log::warn!("TcpConnection::shutdown_in_loop [{}]: {e}", self.0.name);
            }
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> std::io::Result<()> {
        sockets::set_tcp_no_delay(self.0.fd, on)
    }

    pub fn set_tcp_keep_alive(&self, on: bool) -> std::io::Result<()> {
        sockets::set_keep_alive(self.0.fd, on)
    }

    /// Final teardown: transitions to `Disconnected`, fires the
    /// connection callback one last time (so user code observes
    /// `connected() == false`), and deregisters the channel. Posted by
    /// `TcpServer::remove_connection` as a deferred task so the
    /// in-flight close dispatch has returned first (spec §4.7's
    /// "must be the last action" rule for `handle_close`).
    pub(crate) fn destroy_connection(&self) {
        self.0.loop_handle.assert_in_loop_thread();
        assert!(matches!(self.state(), State::Connected | State::Disconnecting));
        self.set_state(State::Disconnected);
        self.0.channel.lock().unwrap().disable_all();
        self.fire_connection_callback();
        EventLoop::with_current(|lp| lp.remove_channel(self.0.fd));
    }
}

impl Inner {
    fn handle_read(this: &TcpConnection, recv_time: Timestamp) {
        this.0.loop_handle.assert_in_loop_thread();
        let n = {
            let mut input = this.0.input_buffer.lock().unwrap();
            input.read_fd(this.0.fd)
        };
        match n {
            Ok(n) if n > 0 => {
                if let Some(cb) = this.0.message_cb.lock().unwrap().clone() {
                    let mut input = this.0.input_buffer.lock().unwrap();
                    cb(this, &mut input, recv_time);
                }
            }
            Ok(_) => Inner::handle_close(this),
            Err(e) => {
                log::warn!("TcpConnection::handle_read [{}]: {e}", this.0.name);
                Inner::handle_error(this);
            }
        }
    }

    fn handle_write(this: &TcpConnection) {
        this.0.loop_handle.assert_in_loop_thread();
        let is_writing = this.0.channel.lock().unwrap().is_writing();
        if !is_writing {
            log::debug!("TcpConnection::handle_write [{}]: connection is down, no more writing", this.0.name);
            return;
        }

        let (peek, readable) = {
            let output = this.0.output_buffer.lock().unwrap();
            (output.peek().to_vec(), output.readable_bytes())
        };
        let _ = readable;

        match sockets::write_fd(this.0.fd, &peek) {
            Ok(n) if n > 0 => {
                this.0.output_buffer.lock().unwrap().retrieve(n);
                let now_empty = this.0.output_buffer.lock().unwrap().readable_bytes() == 0;
                if now_empty {
                    let mut channel = this.0.channel.lock().unwrap();
                    channel.disable_writing();
                    let events = channel.events();
                    drop(channel);
                    let dispatchable: Arc<dyn Dispatchable> = Arc::new(this.clone());
                    EventLoop::with_current(|lp| lp.update_channel(this.0.fd, events, dispatchable));

                    if let Some(cb) = this.0.write_complete_cb.lock().unwrap().clone() {
                        let this2 = this.clone();
                        this.0.loop_handle.queue_in_loop(move || cb(&this2));
                    }
                    if this.state() == State::Disconnecting {
                        this.shutdown_in_loop();
                    }
                } else {
                    log::debug!("TcpConnection::handle_write [{}]: more data queued", this.0.name);
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("TcpConnection::handle_write [{}]: {e}", this.0.name);
            }
        }
    }

    fn handle_close(this: &TcpConnection) {
        this.0.loop_handle.assert_in_loop_thread();
        let state = this.state();
        assert!(matches!(state, State::Connected | State::Disconnecting));
        this.0.channel.lock().unwrap().disable_all();

        // Must be last: the close callback (TcpServer::remove_connection)
        // can drop the server's map entry, the last strong reference
        // competing with this dispatch's own `Arc<Inner>` clone.
        if let Some(cb) = this.0.close_cb.lock().unwrap().clone() {
            cb(this.clone());
        }
    }

    fn handle_error(this: &TcpConnection) {
        match sockets::socket_error(this.0.fd) {
            Ok(err) => log::warn!(
                "TcpConnection::handle_error [{}] - SO_ERROR = {err}",
                this.0.name
            ),
            Err(e) => log::warn!("TcpConnection::handle_error [{}]: {e}", this.0.name),
        }
    }
}

impl Dispatchable for TcpConnection {
    fn dispatch(&self, recv_time: Timestamp, revents: Events) {
        let mut channel = self.0.channel.lock().unwrap();
        channel.set_revents(revents);
        drop(channel);

        // Re-derive the fixed dispatch order from spec §4.2 directly
        // (rather than delegating to `Channel::handle_events`) because
        // the handlers here take `&TcpConnection`, not the no-argument
        // closures `Channel` itself stores.
        if revents.contains(Events::NVAL) {
            log::warn!("TcpConnection [{}]: POLLNVAL", self.0.name);
        }
        if revents.contains(Events::HUP) && !revents.intersects(Events::IN) {
            Inner::handle_close(self);
        }
        if revents.contains(Events::ERR) || revents.contains(Events::NVAL) {
            Inner::handle_error(self);
        }
        if revents.intersects(Events::READABLE | Events::RDHUP) {
            Inner::handle_read(self, recv_time);
        }
        if revents.contains(Events::WRITABLE) {
            Inner::handle_write(self);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        sockets::close(self.fd);
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.0.name)
            .field("state", &self.state())
            .field("peer_addr", &self.0.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn make_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr()) };
        (fds[0], fds[1])
    }

    #[test]
    fn fresh_connection_starts_connecting() {
        let lp = EventLoop::new().unwrap();
        let (a, _b) = make_pair();
        let conn = TcpConnection::new(
            lp.handle(),
            "test#1".into(),
            a,
            InetAddress::loopback(0),
            InetAddress::loopback(0),
        );
        assert_eq!(conn.state(), State::Connecting);
        assert!(!conn.connected());
    }

    #[test]
    fn establish_then_destroy_round_trips_state() {
        let (a, b) = make_pair();

        let fired_connected = Arc::new(AtomicBool::new(false));
        let fired_disconnected = Arc::new(AtomicBool::new(false));
        let fc = fired_connected.clone();
        let fd_ = fired_disconnected.clone();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let mut lp = EventLoop::new().unwrap();
            tx.send(lp.handle()).unwrap();
            lp.run().unwrap();
        });
        let handle: EventLoopHandle = rx.recv().unwrap();

        let conn = TcpConnection::new(
            handle.clone(),
            "test#2".into(),
            a,
            InetAddress::loopback(0),
            InetAddress::loopback(0),
        );
        conn.set_connection_callback(Arc::new(move |c: &TcpConnection| {
            if c.connected() {
                fc.store(true, Ordering::SeqCst);
            } else {
                fd_.store(true, Ordering::SeqCst);
            }
        }));

        let conn2 = conn.clone();
        let handle2 = handle.clone();
        handle.run_in_loop(move || {
            conn2.establish_connection();
            assert_eq!(conn2.state(), State::Connected);
            conn2.destroy_connection();
            assert_eq!(conn2.state(), State::Disconnected);
            handle2.quit();
        });

        worker.join().unwrap();
        assert!(fired_connected.load(Ordering::SeqCst));
        assert!(fired_disconnected.load(Ordering::SeqCst));
        unsafe {
            libc::close(b);
        }
    }
}
