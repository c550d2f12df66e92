//! Human-readable formatting for run summaries.

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

pub fn format_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

/// Elapsed wall time; sub-minute runs keep two decimals
pub fn format_elapsed(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{:.2}s", seconds.max(0.0));
    }
    let whole = seconds as u64;
    if whole < 3600 {
        format!("{}m {}s", whole / 60, whole % 60)
    } else {
        format!("{}h {}m {}s", whole / 3600, (whole % 3600) / 60, whole % 60)
    }
}

/// Average copy rate, e.g. `12.50 MiB/s`
pub fn format_rate(bytes: u64, seconds: f64) -> String {
    if seconds <= 0.0 {
        return "n/a".to_string();
    }
    format!("{}/s", format_bytes((bytes as f64 / seconds) as u64))
}
