//! Human-readable formatting helpers shared by the CLI and status output.

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count with a binary unit suffix (e.g., "1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        let rounded = (value * 10.0).round() / 10.0;
        if rounded.fract() == 0.0 {
            format!("{} {}", rounded as u64, UNITS[unit])
        } else {
            format!("{:.1} {}", rounded, UNITS[unit])
        }
    }
}

/// Round a percentage to the nearest whole number, clamped to 0..=100
pub fn round_percentage(value: f64) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
    }

    #[test]
    fn test_round_percentage() {
        assert_eq!(round_percentage(49.5), 50);
        assert_eq!(round_percentage(49.4), 49);
        assert_eq!(round_percentage(-3.0), 0);
        assert_eq!(round_percentage(140.0), 100);
        assert_eq!(round_percentage(f64::NAN), 0);
    }
}
