//! One loop per thread. Owns the [`Poller`], the [`TimerQueue`], a
//! wakeup `eventfd`, and the pending-task queue; every other operation
//! in this crate ultimately runs as a callback dispatched from here.
//! See spec §4.4.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::channel::Events;
use crate::error::ReactorError;
use crate::poller::{ChannelId, Poller};
use crate::timer::{Timer, TimerCallback, TimerId};
use crate::timer_queue::{make_timer, TimerQueue};
use crate::timestamp::Timestamp;

/// How long a single `poll(2)` call is allowed to block when nothing is
/// pending. Bounds how stale a picture `EventLoop` has of its own
/// `quit_` flag when woken by nothing but the clock.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// A generic unit of work posted to a loop, always run on that loop's
/// thread. Mirrors the source's `Functor = std::function<void()>`.
type Task = Box<dyn FnOnce() + Send>;

/// Anything registered with a loop that can react to readiness. A
/// `TcpConnection` or `Acceptor` implements this over its own
/// `Mutex`-guarded state; the `Send + Sync` bound is what lets the
/// registry hold it as a trait object shared with the outside world
/// (see the note on [`crate::channel::ReadCallback`]).
pub trait Dispatchable: Send + Sync {
    fn dispatch(&self, recv_time: Timestamp, revents: Events);
}

/// The part of an `EventLoop` that's safe to touch from other threads:
/// the wakeup fd (write-only from elsewhere), the pending-task queue
/// (the one mutex in the core, per spec §5), and a few flags. Nothing
/// here ever sees the loop's `Poller`, channel registry, or timer set.
struct Shared {
    wakeup_fd: RawFd,
    pending: Mutex<VecDeque<Task>>,
    quit: AtomicBool,
    looping: AtomicBool,
    calling_pending_functors: AtomicBool,
    thread_id: ThreadId,
}

impl Shared {
    fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "operation invoked from a thread other than this EventLoop's owning thread"
        );
    }
}

/// A cheap, `Clone`-able, cross-thread-safe reference to a running
/// loop. This is the only thing most of the crate needs to hold onto a
/// loop: `wakeup`, `quit`, `run_in_loop`, `queue_in_loop`, and the
/// timer-scheduling family are the operations spec §4.4.1 allows
/// off-thread.
#[derive(Clone)]
pub struct EventLoopHandle(Arc<Shared>);

impl PartialEq for EventLoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for EventLoopHandle {}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventLoopHandle({:?})", self.0.thread_id)
    }
}

impl EventLoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.0.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.0.assert_in_loop_thread()
    }

    /// Wakes a blocked `poll(2)` call by writing to the loop's eventfd.
    /// Safe from any thread; harmless if the loop is already awake.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.0.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            log::warn!("EventLoop::wakeup wrote {n} bytes, expected 8");
        }
    }

    /// Requests the loop stop after its current iteration. Safe from
    /// any thread.
    pub fn quit(&self) {
        self.0.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` now if already on the loop thread, otherwise posts
    /// it and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() && self.0.looping.load(Ordering::Acquire) {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always posts `task` for later, even when called from the loop
    /// thread itself — useful for breaking out of a callback's own
    /// call stack (e.g. destroying the connection that's mid-dispatch).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.0.pending.lock().unwrap().push_back(Box::new(task));
        if !self.is_in_loop_thread() || self.0.calling_pending_functors.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Schedules `callback` to run at `when`. Thread-safe: the `Timer`
    /// (and its `TimerId`) is built immediately; insertion into the
    /// queue is posted to the owning loop.
    pub fn run_at(&self, when: Timestamp, callback: TimerCallback) -> TimerId {
        let timer = make_timer(callback, when, 0.0);
        let id = timer.id;
        self.run_in_loop(move || {
            EventLoop::with_current(|lp| lp.insert_timer(timer));
        });
        id
    }

    pub fn run_after(&self, delay_seconds: f64, callback: TimerCallback) -> TimerId {
        self.run_at(Timestamp::now().add_seconds(delay_seconds), callback)
    }

    pub fn run_every(&self, interval_seconds: f64, callback: TimerCallback) -> TimerId {
        let timer = make_timer(
            callback,
            Timestamp::now().add_seconds(interval_seconds),
            interval_seconds,
        );
        let id = timer.id;
        self.run_in_loop(move || {
            EventLoop::with_current(|lp| lp.insert_timer(timer));
        });
        id
    }

    /// Cancels a previously scheduled timer. A no-op if it already
    /// fired (one-shot) or was never live.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            EventLoop::with_current(|lp| lp.cancel_timer(id));
        });
    }
}

thread_local! {
    static CURRENT: Cell<*mut EventLoop> = Cell::new(std::ptr::null_mut());
}

struct CurrentGuard;

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(std::ptr::null_mut()));
    }
}

/// The reactor. Lives on the stack of the thread that calls
/// [`EventLoop::run`] and must never be touched — other than through
/// an [`EventLoopHandle`] — from any other thread.
pub struct EventLoop {
    shared: Arc<Shared>,
    poller: Poller,
    registry: HashMap<ChannelId, Arc<dyn Dispatchable>>,
    timer_queue: TimerQueue,
    wakeup_fd: RawFd,
    timer_fd: RawFd,
    /// The channel id currently being dispatched, if any — lets
    /// `remove_channel` catch an attempt to tear down a channel from
    /// inside its own event dispatch (spec §4.2's re-entrancy rule).
    dispatching: Option<ChannelId>,
}

impl EventLoop {
    /// Creates a loop bound to the calling thread. Must be called on
    /// whatever thread will later call [`EventLoop::run`].
    pub fn new() -> Result<EventLoop, ReactorError> {
        let timer_queue = TimerQueue::new().map_err(ReactorError::TimerInit)?;

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(ReactorError::WakeupInit(io::Error::last_os_error()));
        }

        let timer_fd = timer_queue.fd();

        let mut poller = Poller::new();
        poller.update_channel(timer_fd as ChannelId, timer_fd, Events::READABLE);
        poller.update_channel(wakeup_fd as ChannelId, wakeup_fd, Events::READABLE);

        let shared = Arc::new(Shared {
            wakeup_fd,
            pending: Mutex::new(VecDeque::new()),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            thread_id: std::thread::current().id(),
        });

        Ok(EventLoop {
            shared,
            poller,
            registry: HashMap::new(),
            timer_queue,
            wakeup_fd,
            timer_fd,
            dispatching: None,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle(self.shared.clone())
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread()
    }

    /// Runs this loop until [`EventLoopHandle::quit`] is called. Must
    /// be called on the thread that created this loop.
    pub fn run(&mut self) -> io::Result<()> {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop::run called from a different thread than EventLoop::new"
        );

        CURRENT.with(|c| c.set(self as *mut EventLoop));
        let _guard = CurrentGuard;

        self.shared.quit.store(false, Ordering::Release);
        self.shared.looping.store(true, Ordering::Release);
        log::debug!("EventLoop {:?} starting", self.shared.thread_id);

        while !self.shared.quit.load(Ordering::Acquire) {
            let (recv_time, active) = self.poller.poll(POLL_TIMEOUT_MS)?;

            for (id, revents) in active {
                if id == self.wakeup_fd as ChannelId {
                    Self::drain_wakeup(self.wakeup_fd);
                    continue;
                }
                if id == self.timer_fd as ChannelId {
                    self.timer_queue.handle_read(recv_time);
                    continue;
                }
                if let Some(handler) = self.registry.get(&id).cloned() {
                    self.dispatching = Some(id);
                    handler.dispatch(recv_time, revents);
                    self.dispatching = None;
                }
            }

            self.do_pending_functors();
        }

        self.shared.looping.store(false, Ordering::Release);
        log::debug!("EventLoop {:?} stopped", self.shared.thread_id);
        Ok(())
    }

    fn drain_wakeup(fd: RawFd) {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("EventLoop wakeup read failed: {err}");
            }
        }
    }

    fn do_pending_functors(&mut self) {
        self.shared
            .calling_pending_functors
            .store(true, Ordering::Release);

        let tasks = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        for task in tasks {
            task();
        }

        self.shared
            .calling_pending_functors
            .store(false, Ordering::Release);
    }

    /// Registers (or re-registers) interest for `fd` and remembers
    /// `handler` as the thing to notify. Must be called on the loop
    /// thread — normally from inside [`EventLoop::with_current`].
    pub fn update_channel(&mut self, fd: RawFd, events: Events, handler: Arc<dyn Dispatchable>) {
        self.assert_in_loop_thread();
        let id = fd as ChannelId;
        self.poller.update_channel(id, fd, events);
        self.registry.insert(id, handler);
    }

    /// Deregisters `fd` entirely. Panics if called while `fd`'s own
    /// dispatch is on the call stack — destruction triggered from
    /// within a callback must be deferred via `queue_in_loop`.
    pub fn remove_channel(&mut self, fd: RawFd) {
        self.assert_in_loop_thread();
        let id = fd as ChannelId;
        assert_ne!(
            self.dispatching,
            Some(id),
            "channel fd={fd} removed itself from inside its own dispatch"
        );
        self.poller.remove_channel(id);
        self.registry.remove(&id);
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.poller.has_channel(fd as ChannelId)
    }

    pub(crate) fn insert_timer(&mut self, timer: Timer) {
        self.timer_queue.insert(timer);
    }

    pub(crate) fn cancel_timer(&mut self, id: TimerId) {
        self.timer_queue.cancel(id);
    }

    /// Runs `f` with mutable access to the `EventLoop` currently
    /// running on this thread. Panics outside of one — every call site
    /// in this crate is reached from a callback or posted task, both
    /// of which only ever execute from within [`EventLoop::run`].
    pub fn with_current<R>(f: impl FnOnce(&mut EventLoop) -> R) -> R {
        CURRENT.with(|c| {
            let ptr = c.get();
            assert!(!ptr.is_null(), "no EventLoop is running on this thread");
            // Safety: only ever set to point at `self` for the dynamic
            // extent of that `EventLoop::run` call, on this same
            // thread, and `run` takes `&mut self` so nothing else can
            // be holding a live reference to it concurrently.
            let event_loop = unsafe { &mut *ptr };
            f(event_loop)
        })
    }

    /// Like [`EventLoop::with_current`] but returns `None` instead of
    /// panicking when no loop is running on this thread.
    pub fn try_with_current<R>(f: impl FnOnce(&mut EventLoop) -> R) -> Option<R> {
        CURRENT.with(|c| {
            let ptr = c.get();
            if ptr.is_null() {
                None
            } else {
                Some(f(unsafe { &mut *ptr }))
            }
        })
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn quit_from_another_thread_stops_run() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let mut lp = EventLoop::new().unwrap();
            tx.send(lp.handle()).unwrap();
            lp.run().unwrap();
        });

        let handle: EventLoopHandle = rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        handle.quit();
        worker.join().unwrap();
    }

    #[test]
    fn queued_task_runs_on_loop_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let mut lp = EventLoop::new().unwrap();
            tx.send(lp.handle()).unwrap();
            lp.run().unwrap();
        });

        let handle: EventLoopHandle = rx.recv().unwrap();
        let handle2 = handle.clone();
        handle.queue_in_loop(move || {
            ran2.store(true, Ordering::SeqCst);
            handle2.quit();
        });
        worker.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn run_after_fires_roughly_on_schedule() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let mut lp = EventLoop::new().unwrap();
            tx.send(lp.handle()).unwrap();
            lp.run().unwrap();
        });

        let handle: EventLoopHandle = rx.recv().unwrap();
        let handle2 = handle.clone();
        handle.run_after(
            0.02,
            Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
                handle2.quit();
            }),
        );
        worker.join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let mut lp = EventLoop::new().unwrap();
            tx.send(lp.handle()).unwrap();
            lp.run().unwrap();
        });

        let handle: EventLoopHandle = rx.recv().unwrap();
        let id = handle.run_after(
            0.05,
            Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel(id);

        let handle2 = handle.clone();
        handle.run_after(0.12, Box::new(move || handle2.quit()));

        worker.join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
