//! Loopback HTTP transport.
//!
//! Requests go out over HTTPS first (certificate checks disabled, the
//! language server uses a self-signed certificate). When HTTPS fails and the
//! request allows it, the transport retries once over plain HTTP and
//! remembers the downgrade per `host:port` in a shared [`ProtocolCache`].

mod exchange;
mod protocol;

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub use exchange::{Exchange, HttpRequest, Method, RawResponse, UreqExchange};
pub use protocol::{Authority, ProtocolCache, Scheme};

/// Transport-level failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Connection, TLS, or protocol failure
    #[error("{scheme} request failed: {message}")]
    Request { scheme: Scheme, message: String },

    /// No complete response within the request timeout
    #[error("{scheme} request timeout")]
    Timeout { scheme: Scheme },

    /// Body was not JSON and the status was below 400
    #[error("Invalid JSON response: {snippet}")]
    InvalidJson { snippet: String },

    /// The blocking exchange task was cancelled or panicked
    #[error("transport task failed: {0}")]
    Join(String),
}

/// Decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub data: Value,
    /// Scheme the response arrived on
    pub scheme: Scheme,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Result of a reachability probe against one port
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    /// HTTP status, or 0 when no response was received
    pub status: u16,
    pub scheme: Scheme,
    pub error: Option<String>,
}

/// HTTPS-first transport with a one-time HTTP fallback
#[derive(Clone)]
pub struct HttpTransport {
    exchange: Arc<dyn Exchange>,
    protocols: Arc<ProtocolCache>,
}

impl HttpTransport {
    pub fn new(exchange: Arc<dyn Exchange>, protocols: Arc<ProtocolCache>) -> Self {
        Self {
            exchange,
            protocols,
        }
    }

    /// Transport backed by `ureq` with a fresh protocol cache
    pub fn loopback() -> Self {
        Self::new(Arc::new(UreqExchange), Arc::new(ProtocolCache::new()))
    }

    pub fn protocols(&self) -> &Arc<ProtocolCache> {
        &self.protocols
    }

    /// Send a request, downgrading to HTTP when allowed.
    ///
    /// Non-2xx responses with a JSON body are returned as responses, not
    /// errors. When both schemes fail, the HTTPS error is returned.
    pub async fn request(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        if self.protocols.get(&request.authority) == Scheme::Http {
            return self.send(Scheme::Http, request).await;
        }

        let secure_error = match self.send(Scheme::Https, request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        if !request.allow_fallback {
            return Err(secure_error);
        }

        debug!(
            "HTTPS failed for {} ({}), trying HTTP",
            request.authority, secure_error
        );

        match self.send(Scheme::Http, request).await {
            Ok(response) => {
                debug!("Caching HTTP for {}", request.authority);
                self.protocols.set(request.authority.clone(), Scheme::Http);
                Ok(response)
            }
            Err(plain_error) => {
                debug!("HTTP also failed for {}: {}", request.authority, plain_error);
                Err(secure_error)
            }
        }
    }

    /// Probe an endpoint; success means a 200 response on either scheme
    pub async fn probe(&self, request: &HttpRequest) -> ProbeOutcome {
        match self.request(request).await {
            Ok(response) => ProbeOutcome {
                success: response.status == 200,
                status: response.status,
                scheme: response.scheme,
                error: None,
            },
            Err(e) => ProbeOutcome {
                success: false,
                status: 0,
                scheme: Scheme::Https,
                error: Some(e.to_string()),
            },
        }
    }

    async fn send(
        &self,
        scheme: Scheme,
        request: &HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        let raw = self.exchange.exchange(scheme, request).await?;
        decode_response(raw, scheme)
    }
}

/// Decode a raw body as JSON.
///
/// An empty body decodes as `{}`. A non-JSON body with status >= 400
/// becomes `{"error": "HTTP <status>: <first 100 chars>"}`.
pub fn decode_response(raw: RawResponse, scheme: Scheme) -> Result<HttpResponse, TransportError> {
    let data = if raw.body.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str::<Value>(&raw.body) {
            Ok(value) => value,
            Err(_) if raw.status >= 400 => json!({
                "error": format!("HTTP {}: {}", raw.status, snippet(&raw.body)),
            }),
            Err(_) => {
                return Err(TransportError::InvalidJson {
                    snippet: snippet(&raw.body),
                })
            }
        }
    };

    Ok(HttpResponse {
        status: raw.status,
        data,
        scheme,
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(100).collect()
}
