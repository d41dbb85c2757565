//! Quota fetch against the language server's GetUserStatus route.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::format::format_time_until_reset;
use super::types::{PromptCredits, QuotaModelSample, QuotaSnapshot};
use super::wire::{numeric, UserStatus};
use crate::discovery::ServerConnection;
use crate::retry::{retry_with, RetryPolicy};
use crate::transport::{Authority, HttpRequest, HttpTransport, TransportError};

/// Quota route on the language server
pub const DEFAULT_API_PATH: &str = "/exa.language_server_pb.LanguageServerService/GetUserStatus";

/// Timeout for one quota request
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a quota fetch produced no snapshot
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuotaError {
    /// No server connection has been established
    #[error("no language server connection")]
    NotConnected,

    /// The server rejected the CSRF token
    #[error("authentication rejected (HTTP {status})")]
    AuthFailed { status: u16 },

    /// Response without user status and a non-200 status
    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },

    /// 200 response without user status
    #[error("invalid response structure")]
    InvalidStructure,

    /// User status present but not in the expected shape
    #[error("response parsing failed: {0}")]
    Transform(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl QuotaError {
    /// Diagnostic flag describing why the last fetch failed to parse
    pub fn parsing_flag(&self) -> Option<String> {
        match self {
            QuotaError::AuthFailed { status } => Some(format!("AUTH_FAILED_{}", status)),
            QuotaError::HttpStatus { status } => Some(format!("HTTP_ERROR_{}", status)),
            QuotaError::InvalidStructure => Some("Invalid Response Structure".to_string()),
            QuotaError::Transform(_) => Some("Response Parsing Failed".to_string()),
            QuotaError::NotConnected | QuotaError::Transport(_) => None,
        }
    }

    /// A shape mismatch in the payload rather than an expected failure
    pub fn is_defect(&self) -> bool {
        matches!(self, QuotaError::Transform(_))
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, QuotaError::AuthFailed { .. })
    }
}

/// Fetches quota snapshots for the current server connection
pub struct QuotaService {
    transport: HttpTransport,
    host: String,
    api_path: String,
    policy: RetryPolicy,
    connection: RwLock<Option<ServerConnection>>,
}

impl QuotaService {
    pub fn new(
        transport: HttpTransport,
        host: impl Into<String>,
        api_path: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            host: host.into(),
            api_path: api_path.into(),
            policy: RetryPolicy::fixed(2, Duration::from_secs(1)),
            connection: RwLock::new(None),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_connection(&self, connection: ServerConnection) {
        *self.connection.write() = Some(connection);
    }

    /// Drop the connection and forget which scheme its port answered on
    pub fn clear_connection(&self) {
        if let Some(stale) = self.connection.write().take() {
            self.transport
                .protocols()
                .remove(&Authority::new(self.host.as_str(), stale.port));
        }
    }

    pub fn connection(&self) -> Option<ServerConnection> {
        self.connection.read().clone()
    }

    /// Fetch and normalize the user status, retrying once on failure.
    ///
    /// The returned error describes the final attempt.
    pub async fn fetch_quota(&self) -> Result<QuotaSnapshot, QuotaError> {
        let connection = self.connection().ok_or(QuotaError::NotConnected)?;
        let connection = &connection;

        let result = retry_with(
            &self.policy,
            |snapshot: Option<&QuotaSnapshot>, _: Option<&QuotaError>| snapshot.is_none(),
            |attempt, delay| debug!("Quota fetch attempt {} failed, retrying in {:?}", attempt, delay),
            move |_| async move { self.fetch_once(connection).await.map(Some) },
        )
        .await;

        match result {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(QuotaError::InvalidStructure),
            Err(e) => {
                if let Some(flag) = e.parsing_flag() {
                    warn!("Quota fetch failed: {}", flag);
                } else {
                    warn!("Quota fetch failed: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn fetch_once(&self, connection: &ServerConnection) -> Result<QuotaSnapshot, QuotaError> {
        let request = HttpRequest::post(
            Authority::new(self.host.as_str(), connection.port),
            self.api_path.as_str(),
        )
        .header("Connect-Protocol-Version", "1")
        .header("X-Codeium-Csrf-Token", connection.csrf_token.as_str())
        .json_body(&json!({
            "metadata": {
                "ideName": "antigravity",
                "extensionName": "antigravity",
                "locale": "en",
            }
        }))
        .timeout(FETCH_TIMEOUT);

        let response = self.transport.request(&request).await?;

        if response.status == 401 || response.status == 403 {
            return Err(QuotaError::AuthFailed {
                status: response.status,
            });
        }

        let user_status = match response.data.get("userStatus") {
            Some(value) if !value.is_null() => value,
            _ if response.status != 200 => {
                return Err(QuotaError::HttpStatus {
                    status: response.status,
                })
            }
            _ => return Err(QuotaError::InvalidStructure),
        };

        parse_user_status(user_status, Utc::now())
    }
}

/// Normalize a `userStatus` payload into a snapshot taken at `now`
pub fn parse_user_status(
    user_status: &Value,
    now: DateTime<Utc>,
) -> Result<QuotaSnapshot, QuotaError> {
    let status =
        UserStatus::deserialize(user_status).map_err(|e| QuotaError::Transform(e.to_string()))?;

    let prompt_credits = status.plan_status.as_ref().and_then(|plan| {
        let monthly = numeric(plan.plan_info.as_ref()?.monthly_prompt_credits.as_ref()?)?;
        let available = numeric(plan.available_prompt_credits.as_ref()?)?;
        (monthly > 0.0).then(|| PromptCredits {
            available,
            monthly,
            remaining_percentage: available / monthly * 100.0,
        })
    });

    let configs = status
        .cascade_model_config_data
        .map(|data| data.client_model_configs)
        .unwrap_or_default();

    let mut models = Vec::new();
    for config in configs {
        let Some(quota) = config.quota_info else {
            continue;
        };

        let reset_time = match quota
            .reset_time
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
        {
            Some(Ok(t)) => t.with_timezone(&Utc),
            _ => {
                warn!("Skipping model {:?} with unreadable reset time", config.label);
                continue;
            }
        };

        let fraction = quota.remaining_fraction.unwrap_or(0.0);
        let model_id = config
            .model_or_alias
            .and_then(|m| m.model)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        models.push(QuotaModelSample {
            label: config.label,
            model_id,
            remaining_percentage: fraction * 100.0,
            is_exhausted: fraction == 0.0,
            reset_time,
            time_until_reset: format_time_until_reset((reset_time - now).num_milliseconds()),
        });
    }

    Ok(QuotaSnapshot {
        timestamp: now,
        prompt_credits,
        models,
    })
}
