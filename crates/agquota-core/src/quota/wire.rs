//! Wire shapes of the GetUserStatus response.
//!
//! Only the fields the service reads are modeled; everything else is
//! ignored. Credit counts arrive as numbers or numeric strings.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserStatus {
    #[serde(default)]
    pub plan_status: Option<PlanStatus>,
    #[serde(default)]
    pub cascade_model_config_data: Option<CascadeModelConfigData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlanStatus {
    #[serde(default)]
    pub plan_info: Option<PlanInfo>,
    #[serde(default)]
    pub available_prompt_credits: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlanInfo {
    #[serde(default)]
    pub monthly_prompt_credits: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CascadeModelConfigData {
    #[serde(default)]
    pub client_model_configs: Vec<ClientModelConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientModelConfig {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub model_or_alias: Option<ModelOrAlias>,
    #[serde(default)]
    pub quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelOrAlias {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuotaInfo {
    #[serde(default)]
    pub remaining_fraction: Option<f64>,
    #[serde(default)]
    pub reset_time: Option<String>,
}

/// Read a number that may be encoded as a JSON string
pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
