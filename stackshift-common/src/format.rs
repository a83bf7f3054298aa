//! Formatting utilities for sizes and durations in log lines

use std::time::Duration;

/// Render a byte count with binary units, two decimals ("1.50 KiB")
///
/// # Examples
/// ```
/// use stackshift_common::format_bytes;
/// assert_eq!(format_bytes(1024), "1.00 KiB");
/// assert_eq!(format_bytes(1048576), "1.00 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const STEP: f64 = 1024.0;
    let units = ["B", "KiB", "MiB", "GiB", "TiB"];

    let (value, unit) = units[1..].iter().fold((bytes as f64, units[0]), |(value, unit), next| {
        if value >= STEP { (value / STEP, *next) } else { (value, unit) }
    });

    format!("{value:.2} {unit}")
}

/// Format a duration compactly, keeping sub-second precision for short waits
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use stackshift_common::format_duration;
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
/// assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        let tenths = duration.as_millis() / 100;
        if tenths % 10 == 0 {
            format!("{}s", tenths / 10)
        } else {
            format!("{}.{}s", tenths / 10, tenths % 10)
        }
    } else if secs < 3600 {
        let (mins, rem) = (secs / 60, secs % 60);
        if rem == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {rem}s")
        }
    } else {
        let (hours, mins) = (secs / 3600, (secs % 3600) / 60);
        if mins == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {mins}m")
        }
    }
}
