//! rsync `--stats` summary parsing
//!
//! Everything here is best effort: rsync versions word their summaries
//! differently, and a line we do not recognize leaves the field at its
//! default instead of failing the transfer it describes.

use once_cell::sync::Lazy;
use regex::Regex;
use stackshift_common::TransferStats;

static FILES_TRANSFERRED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Number of (?:regular )?files transferred:\s*([\d,]+)")
        .expect("Invalid files transferred regex")
});

static TOTAL_TRANSFERRED_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Total transferred file size:\s*([\d,]+)\s*bytes")
        .expect("Invalid transferred size regex")
});

static TRANSFER_RATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"sent\s+[\d.,]+\S*\s+bytes\s+received\s+[\d.,]+\S*\s+bytes\s+([\d.,]+\S*\s+bytes/sec)")
        .expect("Invalid transfer rate regex")
});

static SPEEDUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"speedup is\s+([\d.,]+)").expect("Invalid speedup regex")
});

fn strip_separators(digits: &str) -> String {
    digits.chars().filter(|c| *c != ',').collect()
}

/// Count of files transferred, if the line reports it
pub fn parse_files_transferred(line: &str) -> Option<u64> {
    let caps = FILES_TRANSFERRED.captures(line)?;
    strip_separators(&caps[1]).parse().ok()
}

/// Total transferred bytes, if the line reports it
pub fn parse_total_size(line: &str) -> Option<u64> {
    let caps = TOTAL_TRANSFERRED_SIZE.captures(line)?;
    strip_separators(&caps[1]).parse().ok()
}

/// Rate from the `sent ... received ... bytes/sec` line
pub fn parse_transfer_rate(line: &str) -> Option<String> {
    TRANSFER_RATE
        .captures(line)
        .map(|caps| caps[1].to_string())
}

/// Speedup factor from the `total size is ... speedup is N` line
pub fn parse_speedup(line: &str) -> Option<f64> {
    let caps = SPEEDUP.captures(line)?;
    strip_separators(&caps[1]).parse().ok()
}

/// Extract transfer statistics from rsync output
pub fn parse_rsync_stats(output: &str) -> TransferStats {
    let mut stats = TransferStats::default();

    for line in output.lines() {
        if let Some(files) = parse_files_transferred(line) {
            stats.files_transferred = files;
        } else if let Some(size) = parse_total_size(line) {
            stats.total_size = size;
        } else if let Some(rate) = parse_transfer_rate(line) {
            stats.transfer_rate = rate;
        } else if let Some(speedup) = parse_speedup(line) {
            stats.speedup = speedup;
        }
    }

    stats
}
