//! Consumption rate and runway estimate for the active group.

use serde::{Deserialize, Serialize};

use super::history::UsageBucket;

/// Quota pools reset every five hours
pub const QUOTA_RESET_HOURS: f64 = 5.0;

/// Runway text when the group outlasts the next reset
pub const STABLE: &str = "Stable";

/// Usage rate and time-to-exhaustion for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub group_id: String,
    pub group_label: String,
    /// Percentage points consumed per hour
    pub usage_rate: f64,
    pub runway: String,
    pub remaining: f64,
}

impl Prediction {
    pub fn is_stable(&self) -> bool {
        self.runway == STABLE
    }
}

/// Percentage points per hour consumed by `group_id` across the buckets
pub fn usage_rate(buckets: &[UsageBucket], group_id: &str, display_minutes: u64) -> f64 {
    if display_minutes == 0 {
        return 0.0;
    }
    let total: f64 = buckets.iter().map(|b| b.usage_of(group_id)).sum();
    total / (display_minutes as f64 / 60.0)
}

/// Runway text for a rate and remaining percentage.
///
/// "Stable" when nothing is being consumed, nothing is left, or the usage
/// projected until the next reset stays below what remains. Otherwise the
/// time until empty as "~{h}h" (an hour or more) or "~{m}m".
pub fn runway(usage_rate: f64, remaining: f64) -> String {
    if usage_rate <= 0.0 || remaining <= 0.0 {
        return STABLE.to_string();
    }

    let projected = usage_rate * QUOTA_RESET_HOURS;
    if projected < remaining {
        return STABLE.to_string();
    }

    let hours = remaining / usage_rate;
    if hours >= 1.0 {
        format!("~{}h", hours.round() as i64)
    } else {
        format!("~{}m", (hours * 60.0).round() as i64)
    }
}

/// Build the prediction for a group from bucketed history
pub fn predict(
    buckets: &[UsageBucket],
    group_id: &str,
    group_label: &str,
    remaining: f64,
    display_minutes: u64,
) -> Prediction {
    let rate = usage_rate(buckets, group_id, display_minutes);
    Prediction {
        group_id: group_id.to_string(),
        group_label: group_label.to_string(),
        usage_rate: rate,
        runway: runway(rate, remaining),
        remaining,
    }
}
