use std::time::{Duration, Instant};

/// Minimum time between two emitted progress events
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(600);

/// Progress growth (1 MiB) that forces an emission regardless of elapsed time
pub const DEFAULT_MIN_BYTES: u64 = 1024 * 1024;

/// Emission gate for a monotonically growing byte counter.
///
/// An event passes when either enough time elapsed or enough bytes
/// accumulated since the last event that passed. The very first check always
/// passes so a consumer sees movement as soon as it starts.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    min_bytes: u64,
    last_at: Option<Instant>,
    last_bytes: u64,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL, DEFAULT_MIN_BYTES)
    }
}

impl Throttle {
    pub fn new(min_interval: Duration, min_bytes: u64) -> Self {
        Self {
            min_interval,
            min_bytes,
            last_at: None,
            last_bytes: 0,
        }
    }

    pub fn should_emit(&self, now: Instant, done: u64) -> bool {
        match self.last_at {
            None => true,
            Some(at) => {
                now.saturating_duration_since(at) >= self.min_interval
                    || done.saturating_sub(self.last_bytes) >= self.min_bytes
            }
        }
    }

    /// Record an emission at `now` for `done` bytes.
    pub fn mark(&mut self, now: Instant, done: u64) {
        self.last_at = Some(now);
        self.last_bytes = done;
    }

    /// `should_emit` followed by `mark` when it passes.
    pub fn check(&mut self, now: Instant, done: u64) -> bool {
        if self.should_emit(now, done) {
            self.mark(now, done);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_check_always_passes() {
        let mut throttle = Throttle::default();
        assert!(throttle.check(Instant::now(), 0));
    }

    #[test]
    fn small_quick_updates_are_suppressed() {
        let start = Instant::now();
        let mut throttle = Throttle::default();
        assert!(throttle.check(start, 10));
        assert!(!throttle.check(start + Duration::from_millis(100), 20));
        assert!(!throttle.check(start + Duration::from_millis(500), 4096));
    }

    #[test]
    fn interval_elapsed_passes() {
        let start = Instant::now();
        let mut throttle = Throttle::default();
        throttle.mark(start, 0);
        assert!(throttle.check(start + Duration::from_millis(600), 1));
    }

    #[test]
    fn byte_growth_passes_before_interval() {
        let start = Instant::now();
        let mut throttle = Throttle::default();
        throttle.mark(start, 100);
        assert!(!throttle.should_emit(start + Duration::from_millis(1), 100 + DEFAULT_MIN_BYTES - 1));
        assert!(throttle.check(start + Duration::from_millis(1), 100 + DEFAULT_MIN_BYTES));
        // The byte baseline moved with the emission.
        assert!(!throttle.check(start + Duration::from_millis(2), 100 + DEFAULT_MIN_BYTES + 10));
    }
}
