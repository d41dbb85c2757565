//! Single request/response exchange over one scheme.

use std::time::Duration;

use async_trait::async_trait;

use super::protocol::{Authority, Scheme};
use super::TransportError;

/// HTTP method for a loopback request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request addressed to an authority, independent of scheme
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub authority: Authority,
    pub path: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    /// Whether a failed HTTPS attempt may be retried over plain HTTP
    pub allow_fallback: bool,
}

impl HttpRequest {
    /// POST request with a 5 second timeout and fallback enabled
    pub fn post(authority: Authority, path: impl Into<String>) -> Self {
        Self {
            authority,
            path: path.into(),
            method: Method::Post,
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(5),
            allow_fallback: true,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize a JSON payload as the request body
    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.body = Some(value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }
}

/// Status code and undecoded body of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Performs one exchange over a given scheme.
///
/// Implementations must not retry or downgrade on their own; the
/// [`HttpTransport`](super::HttpTransport) owns that policy.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(
        &self,
        scheme: Scheme,
        request: &HttpRequest,
    ) -> Result<RawResponse, TransportError>;
}

/// Blocking `ureq` agent driven from the tokio blocking pool
#[derive(Debug, Default, Clone, Copy)]
pub struct UreqExchange;

#[async_trait]
impl Exchange for UreqExchange {
    async fn exchange(
        &self,
        scheme: Scheme,
        request: &HttpRequest,
    ) -> Result<RawResponse, TransportError> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || blocking_exchange(scheme, &request))
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?
    }
}

fn blocking_exchange(scheme: Scheme, request: &HttpRequest) -> Result<RawResponse, TransportError> {
    let mut config = ureq::Agent::config_builder()
        .timeout_global(Some(request.timeout))
        .http_status_as_error(false);
    if scheme == Scheme::Https {
        // Language server certificates are self-signed
        config = config.tls_config(
            ureq::tls::TlsConfig::builder()
                .disable_verification(true)
                .build(),
        );
    }
    let agent: ureq::Agent = config.build().into();

    let url = request.authority.url(scheme, &request.path);
    let result = match request.method {
        Method::Get => {
            let mut builder = agent.get(&url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder.call()
        }
        Method::Post => {
            let mut builder = agent.post(&url).header("Content-Type", "application/json");
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder.send(request.body.as_deref().unwrap_or(""))
        }
    };

    let mut response = result.map_err(|e| map_ureq_error(scheme, e))?;
    let status = response.status().as_u16();
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| map_ureq_error(scheme, e))?;

    Ok(RawResponse { status, body })
}

fn map_ureq_error(scheme: Scheme, error: ureq::Error) -> TransportError {
    match error {
        ureq::Error::Timeout(_) => TransportError::Timeout { scheme },
        other => TransportError::Request {
            scheme,
            message: other.to_string(),
        },
    }
}
