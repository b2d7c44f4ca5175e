//! Time sources. Sessions take both a wall clock (wire timestamps,
//! SendingTime validation) and a monotonic clock (heartbeat deadlines) so
//! tests can drive time by hand.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + 'static {
    fn wall(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
}

/// Production clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    base_mono: Instant,
    base_wall: DateTime<Utc>,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(base_wall: DateTime<Utc>) -> Self {
        Self {
            base_mono: Instant::now(),
            base_wall,
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }

    fn offset(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn wall(&self) -> DateTime<Utc> {
        self.base_wall + chrono::Duration::from_std(self.offset()).unwrap_or_default()
    }

    fn monotonic(&self) -> Instant {
        self.base_mono + self.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_both_axes() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let m0 = clock.monotonic();
        let w0 = clock.wall();
        clock.advance(Duration::from_secs(45));
        assert_eq!(clock.monotonic() - m0, Duration::from_secs(45));
        assert_eq!(clock.wall() - w0, chrono::Duration::seconds(45));
    }
}
