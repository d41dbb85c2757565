/// Countdown text for a reset that has already passed
pub const READY: &str = "Ready";

/// Format milliseconds until reset as "Ready", "{m}m" or "{h}h {m}m".
///
/// Minutes round up, so 30 seconds reads as "1m".
pub fn format_time_until_reset(ms: i64) -> String {
    if ms <= 0 {
        return READY.to_string();
    }

    let minutes = (ms + 59_999) / 60_000;
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_until_reset() {
        assert_eq!(format_time_until_reset(0), "Ready");
        assert_eq!(format_time_until_reset(-5_000), "Ready");
        assert_eq!(format_time_until_reset(30_000), "1m");
        assert_eq!(format_time_until_reset(90_000), "2m");
        assert_eq!(format_time_until_reset(5_400_000), "1h 30m");
        assert_eq!(format_time_until_reset(59 * 60_000), "59m");
        assert_eq!(format_time_until_reset(60 * 60_000), "1h 0m");
        assert_eq!(format_time_until_reset(125 * 60_000 - 1), "2h 5m");
        assert_eq!(format_time_until_reset(5 * 3_600_000), "5h 0m");
    }
}
