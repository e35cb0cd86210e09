//! Display helpers shared by the status snapshot.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoistureLevel {
    Wet,
    Moderate,
    Dry,
}

/// Bucket a soil moisture percentage for display.
pub fn moisture_level(percent: f64) -> MoistureLevel {
    if percent > 70.0 {
        MoistureLevel::Wet
    } else if percent > 30.0 {
        MoistureLevel::Moderate
    } else {
        MoistureLevel::Dry
    }
}

/// "3h 25m 7s"
pub fn uptime(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{hours}h {minutes}m {secs}s")
}

/// Coarse relative age for the last-received indicator.
pub fn time_ago(elapsed_ms: Option<i64>) -> String {
    let Some(ms) = elapsed_ms else {
        return "never".to_string();
    };
    let sec = ms.max(0) / 1000;
    if sec < 1 {
        return "just now".to_string();
    }
    if sec < 60 {
        return format!("{sec}s ago");
    }
    let m = sec / 60;
    if m < 60 {
        return format!("{m}m ago");
    }
    format!("{}h ago", m / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moisture_buckets() {
        assert_eq!(moisture_level(85.0), MoistureLevel::Wet);
        assert_eq!(moisture_level(70.0), MoistureLevel::Moderate);
        assert_eq!(moisture_level(30.1), MoistureLevel::Moderate);
        assert_eq!(moisture_level(30.0), MoistureLevel::Dry);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(uptime(0), "0h 0m 0s");
        assert_eq!(uptime(12_307), "3h 25m 7s");
        assert_eq!(uptime(90_000), "25h 0m 0s");
    }

    #[test]
    fn time_ago_ranges() {
        assert_eq!(time_ago(None), "never");
        assert_eq!(time_ago(Some(400)), "just now");
        assert_eq!(time_ago(Some(-50)), "just now");
        assert_eq!(time_ago(Some(42_000)), "42s ago");
        assert_eq!(time_ago(Some(5 * 60_000)), "5m ago");
        assert_eq!(time_ago(Some(3 * 3_600_000 + 1)), "3h ago");
    }
}
