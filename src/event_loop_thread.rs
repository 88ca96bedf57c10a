//! Spawns an `EventLoop` onto a dedicated OS thread and hands the
//! spawning thread a handle to it once the loop is actually running.
//! See spec §4.4.2.

use std::io;
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::event_loop::{EventLoop, EventLoopHandle};

/// Owns a background thread whose entire body is `EventLoop::run`.
///
/// Mirrors the source's `EventLoopThread`: the thread function
/// constructs the loop locally (so it's bound to the right thread from
/// birth) and publishes a handle back through a one-shot rendezvous,
/// which doubles as the construction-failure path.
pub struct EventLoopThread {
    join_handle: Option<JoinHandle<()>>,
    handle: EventLoopHandle,
}

impl EventLoopThread {
    /// Spawns the thread and blocks until its `EventLoop` is ready
    /// (or construction failed).
    pub fn start(name: impl Into<String>) -> io::Result<EventLoopThread> {
        let name = name.into();
        let (tx, rx) = mpsc::channel();

        let join_handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut event_loop = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        log::error!("EventLoopThread {name}: failed to build EventLoop: {e}");
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let handle = event_loop.handle();
                if tx.send(Ok(handle)).is_err() {
                    return;
                }
                if let Err(e) = event_loop.run() {
                    log::error!("EventLoopThread {name}: loop exited with error: {e}");
                }
            })?;

        let handle = rx
            .recv()
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::Other,
                    "EventLoopThread's EventLoop dropped before starting",
                )
            })?
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        Ok(EventLoopThread {
            join_handle: Some(join_handle),
            handle,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_starts_and_stops_cleanly() {
        let thread = EventLoopThread::start("test-loop").unwrap();
        let handle = thread.handle();
        assert!(!handle.is_in_loop_thread());
        drop(thread);
    }
}
