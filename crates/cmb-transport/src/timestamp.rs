//! # Wire Timestamps
//!
//! 24-bit millisecond counters relative to a per-process monotonic origin.
//! The counter wraps roughly every 4 h 40 min; subtraction of two timestamps
//! yields the forward elapsed duration modulo the wrap, and ordering uses
//! the same shorter-distance rule as [`crate::seqnum::SequenceNumber`].

use once_cell::sync::Lazy;
use quanta::Instant;
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Modulus of the timestamp space in milliseconds (2^24 ms ≈ 4 h 40 min).
pub const TIMESTAMP_MODULUS_MS: u64 = 1 << 24;

/// Process-wide monotonic origin. All timestamps in one process are measured
/// against the same instant so that echoed values stay comparable.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A 24-bit wrap-around millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timestamp(u32);

impl Timestamp {
    /// The current process-relative timestamp.
    pub fn now() -> Self {
        Timestamp::from_millis(EPOCH.elapsed().as_millis() as u64)
    }

    /// Build from a millisecond count, reducing into the 24-bit space.
    pub fn from_millis(millis: u64) -> Self {
        Timestamp((millis % TIMESTAMP_MODULUS_MS) as u32)
    }

    /// Raw millisecond value in `[0, 2^24)`.
    pub fn as_millis(self) -> u32 {
        self.0
    }

    /// Forward elapsed time from `earlier` to `self`, modulo the wrap.
    ///
    /// Meaningful as long as the true separation is below ~4 h 40 min.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        let millis =
            (self.0 as u64 + TIMESTAMP_MODULUS_MS - earlier.0 as u64) % TIMESTAMP_MODULUS_MS;
        Duration::from_millis(millis)
    }

    /// Whether `self` is past `deadline` in wrap-aware ordering.
    pub fn is_after(self, deadline: Timestamp) -> bool {
        self != deadline && self.duration_since(deadline) < deadline.duration_since(self)
    }

    /// Whether `self` precedes `other` in wrap-aware ordering.
    pub fn is_before(self, other: Timestamp) -> bool {
        other.is_after(self)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp::from_millis(self.0 as u64 + rhs.as_millis() as u64)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        let rhs_ms = rhs.as_millis() as u64 % TIMESTAMP_MODULUS_MS;
        Timestamp::from_millis(self.0 as u64 + TIMESTAMP_MODULUS_MS - rhs_ms)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_millis_reduces_modulo() {
        assert_eq!(Timestamp::from_millis(TIMESTAMP_MODULUS_MS).as_millis(), 0);
        assert_eq!(
            Timestamp::from_millis(TIMESTAMP_MODULUS_MS + 123).as_millis(),
            123
        );
    }

    #[test]
    fn duration_since_simple() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(4_500);
        assert_eq!(b.duration_since(a), Duration::from_millis(3_500));
    }

    #[test]
    fn duration_since_across_wrap() {
        let a = Timestamp::from_millis(TIMESTAMP_MODULUS_MS - 100);
        let b = Timestamp::from_millis(250);
        assert_eq!(b.duration_since(a), Duration::from_millis(350));
    }

    #[test]
    fn add_duration_wraps() {
        let t = Timestamp::from_millis(TIMESTAMP_MODULUS_MS - 1);
        assert_eq!((t + Duration::from_millis(2)).as_millis(), 1);
    }

    #[test]
    fn sub_duration_wraps() {
        let t = Timestamp::from_millis(1);
        assert_eq!(
            (t - Duration::from_millis(2)).as_millis() as u64,
            TIMESTAMP_MODULUS_MS - 1
        );
    }

    #[test]
    fn ordering_within_window() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(2_000);
        assert!(a.is_before(b));
        assert!(b.is_after(a));
        assert!(!a.is_after(a));
    }

    #[test]
    fn ordering_across_wrap() {
        let old = Timestamp::from_millis(TIMESTAMP_MODULUS_MS - 5);
        let new = Timestamp::from_millis(10);
        assert!(old.is_before(new));
        assert!(new.is_after(old));
    }

    #[test]
    fn now_is_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        // Within one wrap period the forward distance must be tiny.
        assert!(b.duration_since(a) < Duration::from_secs(1));
    }
}
