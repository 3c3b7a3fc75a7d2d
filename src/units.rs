//! Human-readable byte counts and durations for status text and gauges.

/// Formats a byte count with a binary unit suffix.
///
/// ```
/// use netjob_core::units::bytes_to_string;
///
/// assert_eq!(bytes_to_string(512), "512B");
/// assert_eq!(bytes_to_string(1536), "1.5KB");
/// assert_eq!(bytes_to_string(50 * 1024 * 1024), "50.0MB");
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bytes_to_string(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1}{unit}")
}

/// Formats a window or wait in seconds as its two largest units.
///
/// ```
/// use netjob_core::units::duration_to_string;
///
/// assert_eq!(duration_to_string(0), "0 seconds");
/// assert_eq!(duration_to_string(1), "1 second");
/// assert_eq!(duration_to_string(90), "1 minute 30 seconds");
/// assert_eq!(duration_to_string(86_400), "1 day");
/// ```
#[must_use]
pub fn duration_to_string(secs: u64) -> String {
    const PARTS: [(u64, &str); 5] = [
        (30 * 86_400, "month"),
        (86_400, "day"),
        (3_600, "hour"),
        (60, "minute"),
        (1, "second"),
    ];
    if secs == 0 {
        return "0 seconds".to_string();
    }

    let mut remaining = secs;
    let mut out: Vec<String> = Vec::new();
    for (size, name) in PARTS {
        if out.len() == 2 {
            break;
        }
        let count = remaining / size;
        if count > 0 {
            remaining %= size;
            let plural = if count == 1 { "" } else { "s" };
            out.push(format!("{count} {name}{plural}"));
        } else if !out.is_empty() {
            // only adjacent units, "1 day 3 seconds" reads wrong
            break;
        }
    }
    out.join(" ")
}
