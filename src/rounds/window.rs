use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Half-open `[start, end)` window of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RoundWindow {
    /// Window of `duration_ms` containing `now`, aligned to multiples of the
    /// duration since the Unix epoch.
    pub fn containing(now: DateTime<Utc>, duration_ms: i64) -> Self {
        debug_assert!(duration_ms > 0);
        let start_ms = now.timestamp_millis().div_euclid(duration_ms) * duration_ms;
        let start = Utc
            .timestamp_millis_opt(start_ms)
            .single()
            .unwrap_or(now);
        Self {
            start,
            end: start + Duration::milliseconds(duration_ms),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Window immediately after this one
    pub fn next(&self) -> Self {
        let len = self.end - self.start;
        Self {
            start: self.end,
            end: self.end + len,
        }
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        (self.end - now).num_milliseconds().max(0)
    }
}

/// Source of wall-clock time. Injected so tests can drive time explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_window_alignment() {
        let window = RoundWindow::containing(at_ms(1_700_000_012_345), 60_000);
        assert_eq!(window.start, at_ms(1_699_999_980_000));
        assert_eq!(window.end, at_ms(1_700_000_040_000));
        assert!(window.contains(at_ms(1_700_000_012_345)));
    }

    #[test]
    fn test_instants_in_same_window_agree() {
        let base = 1_700_000_040_000;
        let first = RoundWindow::containing(at_ms(base), 60_000);
        for offset in [1, 17, 29_999, 59_999] {
            assert_eq!(RoundWindow::containing(at_ms(base + offset), 60_000), first);
        }
    }

    #[test]
    fn test_consecutive_windows_partition_time() {
        let duration = 60_000;
        for t in [0, 1, 59_999, 1_700_000_012_345, 1_700_000_040_000] {
            let here = RoundWindow::containing(at_ms(t), duration);
            let later = RoundWindow::containing(at_ms(t + duration), duration);
            assert_eq!(here.end, later.start);
            assert_eq!(here.next(), later);
        }
    }

    #[test]
    fn test_end_is_exclusive() {
        let window = RoundWindow::containing(at_ms(120_000), 60_000);
        assert_eq!(window.start, at_ms(120_000));
        assert!(!window.contains(window.end));
        assert_eq!(RoundWindow::containing(window.end, 60_000).start, window.end);
    }

    #[test]
    fn test_pre_epoch_instants_floor_downwards() {
        let window = RoundWindow::containing(at_ms(-1), 60_000);
        assert_eq!(window.start, at_ms(-60_000));
        assert_eq!(window.end, at_ms(0));
    }

    #[test]
    fn test_remaining_ms_never_negative() {
        let window = RoundWindow::containing(at_ms(10_000), 60_000);
        assert_eq!(window.remaining_ms(at_ms(10_000)), 50_000);
        assert_eq!(window.remaining_ms(at_ms(90_000)), 0);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(at_ms(0));
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), at_ms(5_000));
        clock.set(at_ms(42));
        assert_eq!(clock.now(), at_ms(42));
    }
}
