//! A monotonic millisecond clock, independent of wall-clock time.
//!
//! Every timer in the TCP/IP engine (retransmission, delayed ACK, persist,
//! keepalive, reassembly expiry, idle timeout) is driven off [`Instant`] and
//! [`Duration`] rather than `std::time` directly, so that the core stays
//! testable without a real clock.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A point in time, represented as milliseconds since an arbitrary epoch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    millis: i64,
}

impl Instant {
    pub const ZERO: Instant = Instant { millis: 0 };

    pub const fn from_millis(millis: i64) -> Instant {
        Instant { millis }
    }

    pub const fn from_secs(secs: i64) -> Instant {
        Instant {
            millis: secs * 1000,
        }
    }

    pub fn now() -> Instant {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Instant {
            millis: now.as_millis() as i64,
        }
    }

    pub const fn total_millis(&self) -> i64 {
        self.millis
    }

    pub const fn secs(&self) -> i64 {
        self.millis / 1000
    }

    pub const fn millis(&self) -> i64 {
        self.millis % 1000
    }

    pub fn checked_sub(&self, duration: Duration) -> Option<Instant> {
        self.millis
            .checked_sub(duration.millis as i64)
            .map(Instant::from_millis)
    }

    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        self.millis
            .checked_add(duration.millis as i64)
            .map(Instant::from_millis)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis().unsigned_abs())
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis + rhs.millis as i64)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.millis += rhs.millis as i64;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis - rhs.millis as i64)
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, rhs: Duration) {
        self.millis -= rhs.millis as i64;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_millis((self.millis - rhs.millis).max(0) as u64)
    }
}

/// A length of time, in milliseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    millis: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { millis: 0 };

    pub const fn from_millis(millis: u64) -> Duration {
        Duration { millis }
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration {
            millis: secs * 1000,
        }
    }

    pub const fn secs(&self) -> u64 {
        self.millis / 1000
    }

    pub const fn millis(&self) -> u64 {
        self.millis
    }

    pub const fn total_millis(&self) -> u64 {
        self.millis
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis % 1000)
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis + rhs.millis)
    }
}

impl Sub<Duration> for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis.saturating_sub(rhs.millis))
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Duration {
        Duration::from_millis(value.as_millis() as u64)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> std::time::Duration {
        std::time::Duration::from_millis(value.millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic_round_trips() {
        let a = Instant::from_millis(1_000);
        let b = a + Duration::from_millis(500);
        assert_eq!(b.total_millis(), 1_500);
        assert_eq!(b - a, Duration::from_millis(500));
    }

    #[test]
    fn instant_sub_saturates_at_zero() {
        let a = Instant::from_millis(100);
        let b = Instant::from_millis(900);
        assert_eq!(a - b, Duration::ZERO);
    }
}
