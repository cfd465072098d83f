//! Throttled progress emission and smoothed transfer-rate estimation.
//!
//! Every type in this crate takes the current [`std::time::Instant`] as an
//! argument instead of reading the clock itself, so the caller decides what
//! "now" is:
//! - [`Throttle`]: decides when a cumulative byte counter is worth reporting
//! - [`RateMeter`]: rolling-window rate with exponential smoothing and stall decay
//! - [`human_bytes`], [`eta_text`], [`status_line`]: display text

mod format;
mod meter;
mod throttle;

pub use format::{eta_text, format_duration, human_bytes, percent, status_line};
pub use meter::{RateMeter, RateSnapshot, DEFAULT_ALPHA, DEFAULT_STALL_AFTER, DEFAULT_WINDOW, TICK_INTERVAL};
pub use throttle::{Throttle, DEFAULT_MIN_BYTES, DEFAULT_MIN_INTERVAL};
