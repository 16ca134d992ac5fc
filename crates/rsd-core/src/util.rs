use std::ops::Range;
use std::time::Duration;

use rand::Rng;

/// Parse a boolean-like environment flag.
/// Accepts 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read an environment variable and parse it with [`parse_bool_flag`].
pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_bool_flag(&raw))
}

/// Uniform delay in `[range.start, range.end)` milliseconds.
pub fn jitter_ms(range: &Range<u64>) -> Duration {
    if range.end <= range.start {
        return Duration::from_millis(range.start);
    }
    Duration::from_millis(rand::rng().random_range(range.clone()))
}
