//! Language server discovery.
//!
//! Finds the local language server process, extracts its CSRF token,
//! enumerates its listening ports, and probes them until one answers the
//! handshake. Every attempt leaves a [`DiscoveryReport`] for diagnostics.

mod ancestry;
mod finder;
mod platform;
mod runner;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Scheme;

pub use ancestry::resolve_ancestry;
pub use finder::{FinderOptions, ProcessFinder, DEFAULT_HANDSHAKE_PATH, PROBE_TIMEOUT};
pub use platform::Platform;
pub use runner::{CommandRunner, ShellCommand, SystemRunner, COMMAND_TIMEOUT};

#[cfg(test)]
pub(crate) use runner::testing::FakeRunner;

/// A running language server as seen in the process table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessCandidate {
    pub pid: u32,
    pub ppid: Option<u32>,
    /// `--extension_server_port` argument, 0 when absent
    pub extension_port: u16,
    pub csrf_token: String,
}

/// Port and token of a reachable language server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConnection {
    pub port: u16,
    pub csrf_token: String,
}

/// Why a discovery attempt produced no connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryFailure {
    /// No language server process found
    #[error("no language server process found")]
    NoProcess,

    /// Several servers running and none belongs to this IDE window
    #[error("multiple language servers found and none matches this window")]
    Ambiguous,

    /// No port answered the handshake
    #[error("no responsive port")]
    NoPort,

    /// A port answered 401/403 and none answered 200
    #[error("handshake rejected the CSRF token")]
    AuthFailed,
}

impl DiscoveryFailure {
    /// Stable reason code
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryFailure::NoProcess => "no_process",
            DiscoveryFailure::Ambiguous => "ambiguous",
            DiscoveryFailure::NoPort => "no_port",
            DiscoveryFailure::AuthFailed => "auth_failed",
        }
    }
}

/// Where a probed port came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortSource {
    #[serde(rename = "cmdline")]
    CommandLine,
    #[serde(rename = "netstat")]
    PortScan,
}

/// One handshake probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationAttempt {
    pub pid: u32,
    pub port: u16,
    /// HTTP status, 0 when no response
    pub status: u16,
    pub error: Option<String>,
    pub protocol: Scheme,
    pub port_source: PortSource,
}

impl CommunicationAttempt {
    pub fn is_auth_rejection(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

/// Diagnostics of the latest discovery attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub process_name: String,
    pub failure_reason: Option<DiscoveryFailure>,
    pub candidate_count: usize,
    pub attempts: Vec<CommunicationAttempt>,
    /// First 8 characters of the CSRF token
    pub token_preview: Option<String>,
    pub ports_from_cmdline: usize,
    pub ports_from_os: usize,
    pub protocol_used: Option<Scheme>,
    /// Retries performed by the outer detect loop
    pub retry_count: u32,
}

impl DiscoveryReport {
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            ..Self::default()
        }
    }
}

/// Outcome of a discovery run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub connection: Option<ServerConnection>,
    pub report: DiscoveryReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_codes_serialize_snake_case() {
        let json = serde_json::to_string(&DiscoveryFailure::AuthFailed).unwrap();
        assert_eq!(json, "\"auth_failed\"");
        assert_eq!(DiscoveryFailure::NoProcess.as_str(), "no_process");
    }

    #[test]
    fn test_port_source_names() {
        assert_eq!(
            serde_json::to_string(&PortSource::CommandLine).unwrap(),
            "\"cmdline\""
        );
        assert_eq!(
            serde_json::to_string(&PortSource::PortScan).unwrap(),
            "\"netstat\""
        );
    }
}
