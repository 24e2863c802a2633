use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window occurrence counter used to throttle restart storms.
///
/// Entries older than the period are evicted lazily on the next `record`.
#[derive(Debug, Default, Clone)]
pub struct CrashCounter {
    occurrences: VecDeque<Instant>,
}

impl CrashCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an occurrence at `now` and returns how many fall within `period`.
    pub fn record(&mut self, now: Instant, period: Duration) -> usize {
        while let Some(&oldest) = self.occurrences.front() {
            if now.saturating_duration_since(oldest) > period {
                self.occurrences.pop_front();
            } else {
                break;
            }
        }
        self.occurrences.push_back(now);
        self.occurrences.len()
    }

    pub fn count(&self) -> usize {
        self.occurrences.len()
    }

    pub fn reset(&mut self) {
        self.occurrences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(60);

    #[test]
    fn counts_occurrences_within_period() {
        let t0 = Instant::now();
        let mut c = CrashCounter::new();
        assert_eq!(c.record(t0, PERIOD), 1);
        assert_eq!(c.record(t0 + Duration::from_secs(5), PERIOD), 2);
        assert_eq!(c.record(t0 + Duration::from_secs(10), PERIOD), 3);
    }

    #[test]
    fn evicts_entries_older_than_period() {
        let t0 = Instant::now();
        let mut c = CrashCounter::new();
        c.record(t0, PERIOD);
        c.record(t0 + Duration::from_secs(30), PERIOD);
        // t0 is now 61s old and drops out; the 30s entry stays.
        assert_eq!(c.record(t0 + Duration::from_secs(61), PERIOD), 2);
    }

    #[test]
    fn entry_exactly_at_period_boundary_is_kept() {
        let t0 = Instant::now();
        let mut c = CrashCounter::new();
        c.record(t0, PERIOD);
        assert_eq!(c.record(t0 + PERIOD, PERIOD), 2);
    }

    #[test]
    fn reset_clears_history() {
        let t0 = Instant::now();
        let mut c = CrashCounter::new();
        c.record(t0, PERIOD);
        c.record(t0, PERIOD);
        c.reset();
        assert_eq!(c.count(), 0);
        assert_eq!(c.record(t0, PERIOD), 1);
    }
}
