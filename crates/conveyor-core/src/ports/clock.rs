//! Clock port.
//!
//! Lease expiry, retry delays, and throttle windows are all judged against
//! this trait, never against `Utc::now()` directly, so tests can move time
//! by hand instead of sleeping.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually-advanced clock.
///
/// Millisecond resolution, which is plenty for lease windows.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// `std` duration to a chrono delta, saturating instead of failing on
/// out-of-range values.
pub(crate) fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_by_hand() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now().timestamp_millis(), start.timestamp_millis());

        clock.advance(Duration::from_secs(90));
        assert_eq!(
            clock.now().timestamp_millis(),
            start.timestamp_millis() + 90_000
        );
    }

    #[test]
    fn huge_durations_saturate() {
        assert_eq!(delta(Duration::MAX), TimeDelta::MAX);
        assert_eq!(delta(Duration::from_secs(5)), TimeDelta::seconds(5));
    }
}
