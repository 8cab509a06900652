use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// A monotonic clock value with microsecond resolution.
///
/// Timestamps are read from `CLOCK_MONOTONIC`, so they order events within a
/// process but carry no calendar meaning. The zero value is the invalid
/// sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

const MICROS_PER_SEC: i64 = 1_000_000;

impl Timestamp {
    /// The current monotonic time.
    pub fn now() -> Timestamp {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid timespec out-pointer for the duration of
        // the call.
        let res = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(res, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
        Timestamp(ts.tv_sec as i64 * MICROS_PER_SEC + ts.tv_nsec as i64 / 1_000)
    }

    /// The invalid sentinel.
    pub fn invalid() -> Timestamp {
        Timestamp(0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    /// Time elapsed since `earlier`, saturating to zero if `earlier` is in
    /// the future.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let delta = self.0.saturating_sub(earlier.0);
        if delta <= 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(delta as u64)
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_micros() as i64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROS_PER_SEC,
            self.0 % MICROS_PER_SEC
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_arithmetic() {
        let t0 = Timestamp::now();
        let t1 = t0 + Duration::from_millis(5);
        assert!(t1 > t0);
        assert_eq!(t1.duration_since(t0), Duration::from_millis(5));
        assert_eq!(t0.duration_since(t1), Duration::ZERO);
    }

    #[test]
    fn invalid_sentinel() {
        assert!(!Timestamp::invalid().is_valid());
        assert!(Timestamp::now().is_valid());
    }
}
