//! A `Channel` binds a raw file descriptor to an interest mask and a set of
//! event handlers, and is the unit the [`Poller`](crate::poller::Poller)
//! tracks.
//!
//! A `Channel` never owns its fd — the fd is owned by whatever enclosing
//! object created it (a `Socket`, a timerfd, the loop's wakeup eventfd).
//! Dropping a `Channel` closes nothing.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::timestamp::Timestamp;

bitflags! {
    /// Readiness bits, modeled directly on the `poll(2)` event mask so the
    /// [`Poller`](crate::poller::Poller) can hand `revents` straight through
    /// without translation.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Events: i16 {
        const IN = libc::POLLIN as i16;
        const READABLE = libc::POLLIN as i16 | libc::POLLPRI as i16;
        const WRITABLE = libc::POLLOUT as i16;
        const HUP = libc::POLLHUP as i16;
        const ERR = libc::POLLERR as i16;
        const NVAL = libc::POLLNVAL as i16;
        const RDHUP = libc::POLLRDHUP as i16;
    }
}

impl Events {
    pub const NONE: Events = Events::empty();
}

// `+ Sync` looks odd on a `FnMut` — nothing ever calls through a shared
// `&Channel` from two threads at once — but it's what lets a `Channel`
// live inside an `Arc`-shared `TcpConnection` at all: `Arc<T>: Send`
// requires `T: Sync`, and that requirement is transitive through every
// field. Thread confinement (spec §8 invariant 2) is what makes the
// promise sound, not the type system.
pub type ReadCallback = Box<dyn FnMut(Timestamp) + Send + Sync>;
pub type EventCallback = Box<dyn FnMut() + Send + Sync>;

/// A passive record associating an fd with interest and handlers.
///
/// A `Channel` is owned by exactly one [`EventLoop`](crate::event_loop::EventLoop)
/// and must only be touched from that loop's thread; see invariant 2 in
/// spec §8. It is illegal to drop a `Channel` while its own
/// [`handle_events`](Channel::handle_events) call is on the stack — this is
/// asserted via `in_handler`.
pub struct Channel {
    fd: RawFd,
    events: Events,
    revents: Events,
    /// Index into the poller's dense pollfd vector; `-1` while unregistered.
    index: i32,
    in_handler: bool,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            events: Events::NONE,
            revents: Events::NONE,
            index: -1,
            in_handler: false,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> Events {
        self.events
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn set_index(&mut self, index: i32) {
        self.index = index;
    }

    pub fn set_revents(&mut self, revents: Events) {
        self.revents = revents;
    }

    pub fn is_none_event(&self) -> bool {
        self.events == Events::NONE
    }

    pub fn is_writing(&self) -> bool {
        self.events.contains(Events::WRITABLE)
    }

    pub fn is_reading(&self) -> bool {
        self.events.contains(Events::READABLE)
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_cb = Some(cb);
    }

    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }

    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_cb = Some(cb);
    }

    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_cb = Some(cb);
    }

    /// Enables read interest. The caller (the owning object, e.g.
    /// `TcpConnection`) is responsible for forwarding this change to the
    /// loop via `EventLoop::update_channel`.
    pub fn enable_reading(&mut self) {
        self.events.insert(Events::READABLE);
    }

    pub fn disable_reading(&mut self) {
        self.events.remove(Events::READABLE);
    }

    pub fn enable_writing(&mut self) {
        self.events.insert(Events::WRITABLE);
    }

    pub fn disable_writing(&mut self) {
        self.events.remove(Events::WRITABLE);
    }

    pub fn disable_all(&mut self) {
        self.events = Events::NONE;
    }

    /// Fans out a readiness notification per spec §4.2's fixed dispatch
    /// order: NVAL (log only) → HUP w/o IN (close) → ERR/NVAL (error) →
    /// IN/PRI/RDHUP (read) → OUT (write).
    pub fn handle_events(&mut self, recv_time: Timestamp) {
        self.in_handler = true;
        let revents = self.revents;

        if revents.contains(Events::NVAL) {
            log::warn!("Channel::handle_events fd={} POLLNVAL", self.fd);
        }

        if revents.contains(Events::HUP) && !revents.intersects(Events::IN) {
            log::warn!("Channel::handle_events fd={} POLLHUP", self.fd);
            if let Some(cb) = self.close_cb.as_mut() {
                cb();
            }
        }

        if revents.contains(Events::ERR) || revents.contains(Events::NVAL) {
            if let Some(cb) = self.error_cb.as_mut() {
                cb();
            }
        }

        if revents.intersects(Events::READABLE | Events::RDHUP) {
            if let Some(cb) = self.read_cb.as_mut() {
                cb(recv_time);
            }
        }

        if revents.contains(Events::WRITABLE) {
            if let Some(cb) = self.write_cb.as_mut() {
                cb();
            }
        }

        self.in_handler = false;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        assert!(
            !self.in_handler,
            "Channel dropped while its own handle_events was on the stack"
        );
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .field("index", &self.index)
            .finish()
    }
}
