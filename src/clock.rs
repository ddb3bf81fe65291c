//! Wall-clock abstraction for lease, expiry and timeout decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Source of the current time.
///
/// Every time-dependent state transition reads the time through this trait so that tests can
/// drive lease expiry and eviction without sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> Millis;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: Millis) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Adds a duration to a timestamp, saturating.
pub fn after(now: Millis, duration: Duration) -> Millis {
    now.saturating_add(duration.as_millis() as u64)
}

/// Bound on wait deadlines; longer timeouts wait this long.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Instant `timeout` from now, capped at a far-future bound.
pub fn deadline(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(1_000, clock.now_millis());
        clock.advance(Duration::from_secs(2));
        assert_eq!(3_000, clock.now_millis());
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(SystemClock.now_millis() > 1_600_000_000_000);
    }

    #[test]
    fn after_saturates() {
        assert_eq!(u64::MAX, after(u64::MAX - 1, Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn deadline_of_huge_timeout() {
        let deadline = deadline(Duration::from_secs(u64::MAX));
        assert!(deadline > tokio::time::Instant::now() + Duration::from_secs(86400 * 365));
    }
}
