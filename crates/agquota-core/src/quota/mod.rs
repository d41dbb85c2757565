//! Quota fetching and normalization.
//!
//! Polls the language server's user status endpoint and turns the raw
//! per-model quota entries into a [`QuotaSnapshot`].

mod format;
mod service;
mod types;
mod wire;

pub use format::{format_time_until_reset, READY};
pub use service::{parse_user_status, QuotaError, QuotaService, DEFAULT_API_PATH, FETCH_TIMEOUT};
pub use types::{PromptCredits, QuotaModelSample, QuotaSnapshot};
