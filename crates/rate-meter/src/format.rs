//! Human-readable renderings of byte counts, rates and ETAs

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count with one decimal using 1024-based units ("1.5 MB").
pub fn human_bytes(bytes: f64) -> String {
    let mut value = if bytes.is_finite() { bytes.max(0.0) } else { 0.0 };
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Format whole seconds as `HH:MM:SS`.
pub fn format_duration(seconds: u64) -> String {
    let (minutes, secs) = (seconds / 60, seconds % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Percentage of `total` reached by `done`, clamped to 0..=100.
pub fn percent(done: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as u32
}

/// ETA text: "Done" once `done` reaches a non-zero `total`, the remaining time
/// when the rate is meaningful, otherwise empty.
pub fn eta_text(done: u64, total: u64, bytes_per_sec: f64) -> String {
    if total > 0 && done >= total {
        return "Done".to_string();
    }
    if bytes_per_sec > 1.0 {
        let remaining = total.saturating_sub(done) as f64;
        return format_duration((remaining / bytes_per_sec) as u64);
    }
    String::new()
}

/// Status bar text, e.g. `1.0 MB / 10.0 MB  (512.0 KB/s)  ETA 00:00:18`.
pub fn status_line(done: u64, total: u64, bytes_per_sec: f64) -> String {
    let eta = eta_text(done, total, bytes_per_sec);
    let suffix = match eta.as_str() {
        "" => String::new(),
        "Done" => "  Done".to_string(),
        _ => format!("  ETA {}", eta),
    };
    format!(
        "{} / {}  ({}/s){}",
        human_bytes(done as f64),
        human_bytes(total as f64),
        human_bytes(bytes_per_sec),
        suffix
    )
}
