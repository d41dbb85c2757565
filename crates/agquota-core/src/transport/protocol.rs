//! Per-authority memory of which scheme a server answered on.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// URL scheme used for a loopback exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// TLS with certificate verification disabled (self-signed local server)
    Https,
    /// Plain HTTP
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Https => write!(f, "HTTPS"),
            Scheme::Http => write!(f, "HTTP"),
        }
    }
}

/// Host and port pair identifying a server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build a full URL for this authority
    pub fn url(&self, scheme: Scheme, path: &str) -> String {
        format!("{}://{}:{}{}", scheme.as_str(), self.host, self.port, path)
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Remembers authorities that only answered over plain HTTP.
///
/// Shared by every transport in the process; entries live for the process
/// lifetime unless explicitly cleared.
#[derive(Debug, Default)]
pub struct ProtocolCache {
    entries: RwLock<HashMap<Authority, Scheme>>,
}

impl ProtocolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme to try first for an authority (HTTPS unless a downgrade was recorded)
    pub fn get(&self, authority: &Authority) -> Scheme {
        self.entries
            .read()
            .get(authority)
            .copied()
            .unwrap_or(Scheme::Https)
    }

    pub fn set(&self, authority: Authority, scheme: Scheme) {
        self.entries.write().insert(authority, scheme);
    }

    /// Forget the recorded scheme for one authority
    pub fn remove(&self, authority: &Authority) {
        self.entries.write().remove(authority);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
