//! A single scheduled callback, and the opaque token used to cancel it.
//!
//! Grounded on `examples/original_source/src/include/timer.h` and
//! `timer_id.h`; unlike the source, [`TimerId`] here is not a decorative
//! handle — `TimerQueue::cancel` actually consumes it (see
//! `timer_queue.rs` and DESIGN.md's note on Open Question 2).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::timestamp::Timestamp;

pub type TimerCallback = Box<dyn FnMut() + Send>;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque, comparable handle to a scheduled timer, stable across
/// re-arming of repeating timers (a repeat keeps the same sequence but
/// gets a new expiration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    fn next() -> TimerId {
        TimerId {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }
}

pub struct Timer {
    pub callback: TimerCallback,
    pub expiration: Timestamp,
    pub interval: f64,
    pub id: TimerId,
}

impl Timer {
    pub fn new(callback: TimerCallback, expiration: Timestamp, interval: f64) -> Timer {
        Timer {
            callback,
            expiration,
            interval,
            id: TimerId::next(),
        }
    }

    pub fn repeats(&self) -> bool {
        self.interval > 0.0
    }

    /// Computes this timer's next expiration, keeping its identity.
    pub fn restarted(self, now: Timestamp) -> Timer {
        let expiration = now.add_seconds(self.interval);
        Timer {
            callback: self.callback,
            expiration,
            interval: self.interval,
            id: self.id,
        }
    }
}
