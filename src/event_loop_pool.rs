//! Creates N worker loops on dedicated threads and hands them out
//! round-robin. See spec §4.6.
//!
//! Grounded on `examples/original_source/src/event_loop_thread_pool.cpp`.
//! `N == 0` keeps all I/O on the base loop, matching the source's
//! `getNextLoop` fallback.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::event_loop::EventLoopHandle;
use crate::event_loop_thread::EventLoopThread;

pub struct EventLoopThreadPool {
    base_loop: EventLoopHandle,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    /// `threads` keeps the `EventLoopThread`s (and thus their
    /// background threads) alive for the pool's lifetime; `loops` is
    /// the parallel vector of cheap handles actually handed out by
    /// `get_next_loop`.
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<EventLoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: EventLoopHandle) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Must be called before [`EventLoopThreadPool::start`].
    pub fn set_thread_num(&self, n: usize) {
        self.num_threads.store(n, Ordering::Relaxed);
    }

    /// Spawns `num_threads` `EventLoopThread`s. Must run on the base
    /// loop; idempotent only in the sense that the source asserts
    /// against a second call, so does this one.
    pub fn start(&self) -> io::Result<()> {
        self.base_loop.assert_in_loop_thread();
        let n = self.num_threads.load(Ordering::Relaxed);

        let mut threads = Vec::with_capacity(n);
        let mut loops = Vec::with_capacity(n);
        for i in 0..n {
            let thread = EventLoopThread::start(format!("io-loop-{i}"))?;
            loops.push(thread.handle());
            threads.push(thread);
        }

        *self.threads.lock().unwrap() = threads;
        *self.loops.lock().unwrap() = loops;
        Ok(())
    }

    /// Round-robin selection; returns the base loop when `N == 0`. Only
    /// ever called from the base loop (spec §4.6).
    pub fn get_next_loop(&self) -> EventLoopHandle {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[idx].clone()
    }
}
