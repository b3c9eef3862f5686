//! Clock access and human-readable formatting helpers.

use chrono::Utc;

/// Current wall-clock time in microseconds since the Unix epoch.
///
/// All timestamps that cross the wire use this clock; end-to-end latency
/// estimates assume the peers keep it synchronized (NTP or better).
pub fn epoch_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Format a bitrate for operator-facing log lines.
pub fn format_bitrate(bits_per_second: u64) -> String {
    let bps = bits_per_second as f64;
    if bps >= 1e9 {
        format!("{:.2} Gbps", bps / 1e9)
    } else if bps >= 1e6 {
        format!("{:.2} Mbps", bps / 1e6)
    } else if bps >= 1e3 {
        format!("{:.2} Kbps", bps / 1e3)
    } else {
        format!("{} bps", bits_per_second)
    }
}

/// Format a microsecond duration for operator-facing log lines.
pub fn format_duration_us(micros: u64) -> String {
    if micros < 1_000 {
        format!("{}us", micros)
    } else if micros < 1_000_000 {
        format!("{:.2}ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2}s", micros as f64 / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(500), "500 bps");
        assert_eq!(format_bitrate(1_500), "1.50 Kbps");
        assert_eq!(format_bitrate(1_500_000), "1.50 Mbps");
        assert_eq!(format_bitrate(1_500_000_000), "1.50 Gbps");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration_us(750), "750us");
        assert_eq!(format_duration_us(1_500), "1.50ms");
        assert_eq!(format_duration_us(2_500_000), "2.50s");
    }

    #[test]
    fn epoch_micros_is_monotonic_enough() {
        let a = epoch_micros();
        let b = epoch_micros();
        assert!(b >= a);
    }
}
