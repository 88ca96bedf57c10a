//! An ordered set of timers exposed through a single `timerfd`, registered
//! directly with the owning [`EventLoop`](crate::event_loop::EventLoop)'s
//! poller by raw fd rather than through a [`Channel`](crate::channel::Channel).
//! See spec §4.3.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;

use crate::timer::{Timer, TimerCallback, TimerId};
use crate::timestamp::Timestamp;

/// `(expiration micros, sequence)` — the sequence tiebreak (TimerId's
/// insertion order) keeps two timers with an identical expiration both
/// independently addressable, per spec's TimerQueue data model and the
/// timer-FIFO law in §8.
type Key = (i64, u64);

fn key_of(timer: &Timer) -> Key {
    (timer.expiration.micros_since_epoch(), timer.id.sequence())
}

pub struct TimerQueue {
    timerfd: RawFd,
    timers: BTreeMap<Key, Timer>,
    /// Identities still eligible to fire; cancellation removes from here
    /// rather than walking the map.
    live: HashSet<TimerId>,
}

const MIN_ARM_MICROS: i64 = 100;

impl TimerQueue {
    pub fn new() -> io::Result<TimerQueue> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_REALTIME, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerQueue {
            timerfd: fd,
            timers: BTreeMap::new(),
            live: HashSet::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.timerfd
    }

    /// Inserts `timer`, returning whether it became the new earliest
    /// expiration (in which case the caller must rearm the timerfd
    /// *after* this call returns — rearming before the insert would race
    /// the earliest-expiration invariant, per spec §4.3's correctness
    /// hazard).
    pub fn insert(&mut self, timer: Timer) -> bool {
        let became_earliest = self
            .timers
            .iter()
            .find(|(_, t)| self.live.contains(&t.id))
            .map(|(&k, _)| key_of(&timer) < k)
            .unwrap_or(true);

        self.live.insert(timer.id);
        self.timers.insert(key_of(&timer), timer);

        if became_earliest {
            self.rearm();
        }
        became_earliest
    }

    /// Removes `id` from the live set. If it was the current head,
    /// rearms the timerfd to the next earliest. Firing later ignores a
    /// popped entry whose id is no longer live.
    pub fn cancel(&mut self, id: TimerId) {
        let was_head = self.timers.values().next().map(|t| t.id) == Some(id);
        self.live.remove(&id);
        if was_head {
            self.rearm();
        }
    }

    /// Reads (and thereby disarms) the timerfd, then: splits at `now`,
    /// runs every expired+live callback, re-inserts repeats, drops
    /// one-shots, and rearms to the new earliest.
    pub fn handle_read(&mut self, now: Timestamp) {
        let mut buf = [0u8; 8];
        let _ = unsafe {
            libc::read(
                self.timerfd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };

        for mut timer in self.pop_expired(now) {
            if !self.live.contains(&timer.id) {
                continue;
            }
            (timer.callback)();
            if timer.repeats() {
                let restarted = timer.restarted(now);
                self.timers.insert(key_of(&restarted), restarted);
            } else {
                self.live.remove(&timer.id);
            }
        }

        self.rearm();
    }

    /// Splits off every timer whose expiration is `<= now`.
    fn pop_expired(&mut self, now: Timestamp) -> Vec<Timer> {
        let split_key: Key = (now.micros_since_epoch() + 1, 0);
        let remaining = self.timers.split_off(&split_key);
        let expired = std::mem::replace(&mut self.timers, remaining);
        expired.into_values().collect()
    }

    fn rearm(&mut self) {
        let next = self.timers.values().find(|t| self.live.contains(&t.id));

        let it_value = match next {
            Some(timer) => {
                let now = Timestamp::now();
                let micros = (timer.expiration.micros_since_epoch() - now.micros_since_epoch())
                    .max(MIN_ARM_MICROS);
                libc::timespec {
                    tv_sec: (micros / 1_000_000) as libc::time_t,
                    tv_nsec: ((micros % 1_000_000) * 1000) as i64,
                }
            }
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value,
        };

        unsafe {
            libc::timerfd_settime(self.timerfd, 0, &spec, std::ptr::null_mut());
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timerfd);
        }
    }
}

/// `addTimer`'s public contract (spec §4.3/§4.4.5): constructs a `Timer`
/// off-loop and is safe to call from any thread — the actual insertion
/// happens on the owning loop via a posted task, wired up in
/// `event_loop.rs`.
pub fn make_timer(callback: TimerCallback, when: Timestamp, interval: f64) -> Timer {
    Timer::new(callback, when, interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn earliest_insert_reports_true() {
        let mut q = TimerQueue::new().unwrap();
        let t1 = Timer::new(Box::new(|| {}), Timestamp::from_micros(i64::MAX), 0.0);
        assert!(q.insert(t1));

        let t2 = Timer::new(Box::new(|| {}), Timestamp::from_micros(1), 0.0);
        assert!(q.insert(t2));

        let t3 = Timer::new(Box::new(|| {}), Timestamp::from_micros(2), 0.0);
        assert!(!q.insert(t3));
    }

    #[test]
    fn non_repeating_timer_fires_once() {
        let mut q = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let now = Timestamp::now();
        let t = Timer::new(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            now,
            0.0,
        );
        q.insert(t);
        q.handle_read(now.add_seconds(1.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        q.handle_read(now.add_seconds(2.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeating_timer_restarts() {
        let mut q = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let now = Timestamp::now();
        let t = Timer::new(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            now,
            0.05,
        );
        q.insert(t);
        q.handle_read(now.add_seconds(0.1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(q.timers.len(), 1);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut q = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let now = Timestamp::now();
        let t = Timer::new(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            now,
            0.0,
        );
        let id = t.id;
        q.insert(t);
        q.cancel(id);
        q.handle_read(now.add_seconds(1.0));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn equal_expirations_both_fire_in_same_drain() {
        let mut q = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let now = Timestamp::now();
        for _ in 0..2 {
            let c = count.clone();
            let t = Timer::new(
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                now,
                0.0,
            );
            q.insert(t);
        }
        q.handle_read(now.add_seconds(1.0));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
