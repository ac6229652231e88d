//! Process-relative coarse clock
//!
//! The engine timestamps segments with seconds since engine start rather than
//! wall time, so a 32-bit counter is enough for any realistic uptime. One
//! writer refreshes the counters; every other thread reads them with relaxed
//! loads.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct TimeSource {
    start: Instant,
    unix_start: u64,
    /// Extra offset applied on top of the monotonic clock, used to simulate
    /// the passage of time in tests and tooling.
    skew_ms: AtomicU64,
    proc_sec: AtomicU32,
    proc_ms: AtomicU64,
}

impl TimeSource {
    pub fn new() -> Self {
        let unix_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            start: Instant::now(),
            unix_start,
            skew_ms: AtomicU64::new(0),
            proc_sec: AtomicU32::new(0),
            proc_ms: AtomicU64::new(0),
        }
    }

    /// Recompute the published counters. Single writer; cheap enough to call
    /// from API entry points that need fresh time.
    pub fn refresh(&self) {
        let ms = self.start.elapsed().as_millis() as u64 + self.skew_ms.load(Ordering::Relaxed);
        self.proc_ms.store(ms, Ordering::Relaxed);
        self.proc_sec.store((ms / 1000) as u32, Ordering::Relaxed);
    }

    /// Seconds since engine start.
    pub fn proc_sec(&self) -> u32 {
        self.proc_sec.load(Ordering::Relaxed)
    }

    /// Milliseconds since engine start.
    pub fn proc_ms(&self) -> u64 {
        self.proc_ms.load(Ordering::Relaxed)
    }

    /// UNIX seconds corresponding to the current process time.
    pub fn unix_sec(&self) -> u64 {
        self.unix_start + u64::from(self.proc_sec())
    }

    /// Shift the clock forward. Expiration and frequency aging react as if
    /// the given duration had elapsed.
    pub fn advance(&self, by: Duration) {
        self.skew_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
        self.refresh();
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero() {
        let time = TimeSource::new();
        assert_eq!(time.proc_sec(), 0);
        assert_eq!(time.proc_ms(), 0);
    }

    #[test]
    fn test_refresh_is_monotonic() {
        let time = TimeSource::new();
        time.refresh();
        let first = time.proc_ms();
        std::thread::sleep(Duration::from_millis(5));
        time.refresh();
        assert!(time.proc_ms() >= first + 5);
    }

    #[test]
    fn test_advance_skews_the_clock() {
        let time = TimeSource::new();
        time.advance(Duration::from_secs(9));
        assert!(time.proc_sec() >= 9);
        assert!(time.unix_sec() >= time.unix_start + 9);
    }
}
