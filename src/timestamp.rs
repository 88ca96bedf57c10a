//! A point in time, microsecond resolution, independent of any particular
//! clock display format (formatting timestamps for display is out of
//! scope for this crate; see spec §1).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
///
/// `Timestamp(0)` is the sentinel "invalid" value — nothing meaningful
/// happened at the epoch itself in this crate's usage, so it's safe to
/// reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const INVALID: Timestamp = Timestamp(0);

    pub const fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    pub fn now() -> Timestamp {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(d.as_micros() as i64)
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns a new `Timestamp` `seconds` (fractional, may be negative)
    /// after `self`.
    pub fn add_seconds(&self, seconds: f64) -> Timestamp {
        let delta = (seconds * 1_000_000.0) as i64;
        Timestamp(self.0 + delta)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Timestamp::INVALID.is_valid());
    }

    #[test]
    fn now_is_valid_and_monotone_ish() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn add_seconds_moves_forward() {
        let t = Timestamp::from_micros(1_000_000);
        let t2 = t.add_seconds(1.5);
        assert_eq!(t2.micros_since_epoch(), 2_500_000);
    }

    #[test]
    fn add_seconds_can_move_backward() {
        let t = Timestamp::from_micros(2_000_000);
        let t2 = t.add_seconds(-0.5);
        assert_eq!(t2.micros_since_epoch(), 1_500_000);
    }

    #[test]
    fn ordering_matches_micros() {
        let a = Timestamp::from_micros(10);
        let b = Timestamp::from_micros(20);
        assert!(a < b);
    }
}
