use log::debug;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::format::{eta_text, percent, status_line};

/// Span of samples used for the instantaneous rate
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(2);

/// Weight of the newest instantaneous rate in the smoothed value
pub const DEFAULT_ALPHA: f64 = 0.15;

/// Time without new bytes after which the displayed rate starts decaying
pub const DEFAULT_STALL_AFTER: Duration = Duration::from_secs(2);

/// Cadence at which a UI-facing ticker is expected to call [`RateMeter::tick`]
pub const TICK_INTERVAL: Duration = Duration::from_millis(600);

/// Smoothed rate derived from periodic `(time, cumulative bytes)` samples.
///
/// While bytes keep arriving the rate is an exponential moving average of the
/// rate across the rolling window. Once no bytes have arrived for
/// `stall_after`, every further tick halves the rate instead, so a stall shows
/// up quickly without the value dropping straight to zero.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    alpha: f64,
    stall_after: Duration,
    samples: VecDeque<(Instant, u64)>,
    rate: f64,
    last_growth: Option<Instant>,
    last_done: u64,
}

/// Everything a status bar needs for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub done_bytes: u64,
    pub total_bytes: u64,
    pub percent: u32,
    pub bytes_per_sec: f64,
    pub eta: String,
    pub status: String,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_ALPHA, DEFAULT_STALL_AFTER)
    }
}

impl RateMeter {
    pub fn new(window: Duration, alpha: f64, stall_after: Duration) -> Self {
        Self {
            window,
            alpha,
            stall_after,
            samples: VecDeque::new(),
            rate: 0.0,
            last_growth: None,
            last_done: 0,
        }
    }

    /// Current smoothed rate in bytes per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Feed the cumulative byte count observed at `now` and return the new
    /// smoothed rate.
    pub fn tick(&mut self, now: Instant, done: u64) -> f64 {
        let first = self.last_growth.is_none();
        if first || done > self.last_done {
            self.last_growth = Some(now);
        }
        self.last_done = self.last_done.max(done);

        self.samples.push_back((now, done));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(at, _)) if now.saturating_duration_since(at) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        let stalled = self
            .last_growth
            .map(|at| now.saturating_duration_since(at) >= self.stall_after)
            .unwrap_or(false);

        if stalled {
            if self.rate > 0.0 {
                debug!("rate_stall: halving {:.1} B/s", self.rate);
            }
            self.rate /= 2.0;
            if self.rate < 1.0 {
                self.rate = 0.0;
            }
            return self.rate;
        }

        if let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back()) {
            let dt = t1.saturating_duration_since(t0).as_secs_f64();
            if dt > 0.0 {
                let instant_rate = b1.saturating_sub(b0) as f64 / dt;
                self.rate = if self.rate == 0.0 {
                    instant_rate
                } else {
                    self.alpha * instant_rate + (1.0 - self.alpha) * self.rate
                };
            }
        }

        self.rate
    }

    /// Tick and render the result against a fixed `total`.
    pub fn snapshot(&mut self, now: Instant, done: u64, total: u64) -> RateSnapshot {
        let rate = self.tick(now, done);
        RateSnapshot {
            done_bytes: done,
            total_bytes: total,
            percent: percent(done, total),
            bytes_per_sec: rate,
            eta: eta_text(done, total, rate),
            status: status_line(done, total, rate),
        }
    }
}
