//! Quota data types normalized from the language server's user status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remaining quota for a single model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaModelSample {
    /// Display label (e.g., "Gemini 3 Pro (High)")
    pub label: String,
    pub model_id: String,
    /// Remaining percentage (0-100)
    pub remaining_percentage: f64,
    pub is_exhausted: bool,
    pub reset_time: DateTime<Utc>,
    /// Formatted countdown (e.g., "2h 5m", "Ready")
    pub time_until_reset: String,
}

impl QuotaModelSample {
    pub fn is_ready(&self) -> bool {
        self.time_until_reset == super::format::READY
    }
}

/// Prompt credit totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCredits {
    pub available: f64,
    pub monthly: f64,
    pub remaining_percentage: f64,
}

/// One successful quota fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_credits: Option<PromptCredits>,
    pub models: Vec<QuotaModelSample>,
}
