//! Process finder: process listing, ancestry disambiguation, port probing.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use super::ancestry::resolve_ancestry;
use super::platform::Platform;
use super::runner::CommandRunner;
use super::{
    CommunicationAttempt, Discovery, DiscoveryFailure, DiscoveryReport, PortSource,
    ProcessCandidate, ServerConnection,
};
use crate::retry::{retry_if_empty, retry_with, RetryPolicy};
use crate::transport::{Authority, HttpRequest, HttpTransport};

/// Handshake route answered by a live language server
pub const DEFAULT_HANDSHAKE_PATH: &str =
    "/exa.language_server_pb.LanguageServerService/GetUnleashData";

/// Timeout for a single handshake probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// Tunables for [`ProcessFinder`]
#[derive(Debug, Clone)]
pub struct FinderOptions {
    pub host: String,
    pub handshake_path: String,
    pub probe_timeout: Duration,
    /// Outer retry loop for [`ProcessFinder::detect`]
    pub policy: RetryPolicy,
}

impl Default for FinderOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            handshake_path: DEFAULT_HANDSHAKE_PATH.to_string(),
            probe_timeout: PROBE_TIMEOUT,
            policy: RetryPolicy::exponential(
                3,
                Duration::from_millis(1500),
                Duration::from_millis(10_000),
            ),
        }
    }
}

/// Locates the language server belonging to this IDE window
pub struct ProcessFinder {
    platform: Platform,
    process_name: String,
    runner: Arc<dyn CommandRunner>,
    transport: HttpTransport,
    options: FinderOptions,
    caller_parent: Option<u32>,
    last_report: Mutex<DiscoveryReport>,
}

impl ProcessFinder {
    pub fn new(
        platform: Platform,
        runner: Arc<dyn CommandRunner>,
        transport: HttpTransport,
        options: FinderOptions,
    ) -> Self {
        let process_name = platform.process_name(std::env::consts::ARCH);
        Self {
            platform,
            last_report: Mutex::new(DiscoveryReport::new(&process_name)),
            process_name,
            runner,
            transport,
            options,
            caller_parent: None,
        }
    }

    /// Override the executable name to search for
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        *self.last_report.lock() = DiscoveryReport::new(&self.process_name);
        self
    }

    /// Pin the caller's parent pid instead of asking the OS
    pub fn with_caller_parent(mut self, ppid: u32) -> Self {
        self.caller_parent = Some(ppid);
        self
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Report from the most recent attempt
    pub fn last_report(&self) -> DiscoveryReport {
        self.last_report.lock().clone()
    }

    /// Run [`ProcessFinder::try_detect`] under the retry policy.
    ///
    /// The returned report describes the final attempt only, plus the
    /// number of retries performed.
    pub async fn detect(&self) -> Discovery {
        let mut retries = 0;
        let this = self;

        let result = retry_with(
            &self.options.policy,
            retry_if_empty,
            |attempt, delay| {
                retries = attempt;
                debug!(
                    "Discovery attempt {} failed, retrying in {:?}",
                    attempt, delay
                );
            },
            move |_| async move {
                let discovery = this.try_detect().await;
                Ok::<_, Infallible>(discovery.connection)
            },
        )
        .await;

        let connection = match result {
            Ok(connection) => connection,
            Err(never) => match never {},
        };

        let mut report = self.last_report.lock();
        report.retry_count = retries;
        match &connection {
            Some(c) => info!("Language server found on port {}", c.port),
            None => warn!(
                "Language server not found after {} attempt(s): {}",
                retries + 1,
                report
                    .failure_reason
                    .map(|r| r.as_str())
                    .unwrap_or("unknown")
            ),
        }

        Discovery {
            connection,
            report: report.clone(),
        }
    }

    /// Single discovery attempt. Resets the diagnostic report first.
    pub async fn try_detect(&self) -> Discovery {
        let mut report = DiscoveryReport::new(&self.process_name);
        let connection = self.detect_once(&mut report).await;
        *self.last_report.lock() = report.clone();
        Discovery { connection, report }
    }

    async fn detect_once(&self, report: &mut DiscoveryReport) -> Option<ServerConnection> {
        let list_cmd = self.platform.process_list_command(&self.process_name);
        let stdout = match self.runner.run(&list_cmd).await {
            Ok(stdout) => stdout,
            Err(e) => {
                debug!("Process listing failed: {:#}", e);
                String::new()
            }
        };

        let candidates = self.platform.parse_process_list(&stdout);
        report.candidate_count = candidates.len();
        debug!(
            "Found {} {} candidate(s)",
            candidates.len(),
            self.process_name
        );

        let chosen = match candidates.len() {
            0 => {
                report.failure_reason = Some(DiscoveryFailure::NoProcess);
                return None;
            }
            1 => candidates[0].clone(),
            _ => match self.disambiguate(&candidates).await {
                Some(candidate) => candidate,
                None => {
                    report.failure_reason = Some(DiscoveryFailure::Ambiguous);
                    return None;
                }
            },
        };

        report.token_preview = Some(chosen.csrf_token.chars().take(8).collect());

        let mut ports = self.listening_ports(chosen.pid).await;
        report.ports_from_os = ports.len();
        if chosen.extension_port > 0 && !ports.contains(&chosen.extension_port) {
            ports.insert(0, chosen.extension_port);
            report.ports_from_cmdline = 1;
        }
        debug!("Probing ports {:?} for pid {}", ports, chosen.pid);

        for port in ports {
            let request = HttpRequest::post(
                Authority::new(self.options.host.as_str(), port),
                self.options.handshake_path.as_str(),
            )
            .header("X-Codeium-Csrf-Token", chosen.csrf_token.as_str())
            .header("Connect-Protocol-Version", "1")
            .json_body(&json!({ "wrapper_data": {} }))
            .timeout(self.options.probe_timeout);

            let outcome = self.transport.probe(&request).await;
            let port_source = if port == chosen.extension_port {
                PortSource::CommandLine
            } else {
                PortSource::PortScan
            };
            debug!(
                "Probe port {} ({:?}): status {} over {}",
                port, port_source, outcome.status, outcome.scheme
            );

            report.attempts.push(CommunicationAttempt {
                pid: chosen.pid,
                port,
                status: outcome.status,
                error: outcome.error,
                protocol: outcome.scheme,
                port_source,
            });

            if outcome.success {
                report.protocol_used = Some(outcome.scheme);
                return Some(ServerConnection {
                    port,
                    csrf_token: chosen.csrf_token,
                });
            }
        }

        let auth_rejected = report.attempts.iter().any(|a| a.is_auth_rejection());
        report.failure_reason = Some(if auth_rejected {
            DiscoveryFailure::AuthFailed
        } else {
            DiscoveryFailure::NoPort
        });
        None
    }

    async fn disambiguate(&self, candidates: &[ProcessCandidate]) -> Option<ProcessCandidate> {
        let Some(caller_parent) = self.caller_parent().await else {
            debug!("Caller parent pid unknown; cannot disambiguate");
            return None;
        };

        // Grandparent lookups only matter when no sibling exists
        let mut parents = HashMap::new();
        if !candidates.iter().any(|c| c.ppid == Some(caller_parent)) {
            for ppid in candidates.iter().filter_map(|c| c.ppid) {
                if parents.contains_key(&ppid) {
                    continue;
                }
                if let Some(grandparent) = self.parent_of(ppid).await {
                    parents.insert(ppid, grandparent);
                }
            }
        }

        let chosen = resolve_ancestry(candidates, caller_parent, &parents)?;
        debug!(
            "Matched pid {} by ancestry (caller parent {})",
            chosen.pid, caller_parent
        );
        Some(chosen.clone())
    }

    async fn caller_parent(&self) -> Option<u32> {
        if let Some(ppid) = self.caller_parent {
            return Some(ppid);
        }
        #[cfg(unix)]
        {
            Some(std::os::unix::process::parent_id())
        }
        #[cfg(not(unix))]
        {
            self.parent_of(std::process::id()).await
        }
    }

    async fn parent_of(&self, pid: u32) -> Option<u32> {
        let stdout = self
            .runner
            .run(&self.platform.parent_pid_command(pid))
            .await
            .ok()?;
        self.platform.parse_parent_pid(&stdout)
    }

    async fn listening_ports(&self, pid: u32) -> Vec<u16> {
        match self.runner.run(&self.platform.port_list_command(pid)).await {
            Ok(stdout) => self.platform.parse_listening_ports(&stdout, pid),
            Err(e) => {
                debug!("Port listing failed for pid {}: {:#}", pid, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::discovery::FakeRunner;
    use crate::transport::testing::ScriptedExchange;
    use crate::transport::{ProtocolCache, Scheme};

    const PS_TWO_SIBLINGS: &str = "\
 5001   777 /ag/language_server_linux_x64 --csrf_token other-window --extension_server_port 41000
 5002   100 /ag/language_server_linux_x64 --csrf_token mine-0123456789 --extension_server_port 42000
";

    fn routes(entries: &[(u16, Scheme, u16)]) -> HashMap<u16, (Scheme, u16, String)> {
        entries
            .iter()
            .map(|(port, scheme, status)| (*port, (*scheme, *status, "{}".to_string())))
            .collect()
    }

    fn finder(runner: FakeRunner, exchange: ScriptedExchange) -> ProcessFinder {
        let transport = HttpTransport::new(Arc::new(exchange), Arc::new(ProtocolCache::new()));
        ProcessFinder::new(
            Platform::Linux,
            Arc::new(runner),
            transport,
            FinderOptions {
                policy: RetryPolicy::fixed(2, Duration::from_millis(10)),
                ..FinderOptions::default()
            },
        )
        .with_process_name("language_server_linux_x64")
        .with_caller_parent(100)
    }

    #[tokio::test]
    async fn test_no_process() {
        let f = finder(FakeRunner::new(), ScriptedExchange::by_port(HashMap::new()));

        let discovery = f.try_detect().await;

        assert_eq!(discovery.connection, None);
        assert_eq!(
            discovery.report.failure_reason,
            Some(DiscoveryFailure::NoProcess)
        );
        assert_eq!(discovery.report.candidate_count, 0);
    }

    #[tokio::test]
    async fn test_sibling_selected_and_cmdline_port_probed_first() {
        let runner = FakeRunner::new()
            .route("ps -A", PS_TWO_SIBLINGS)
            .route("pid=5002", "LISTEN 0 4096 127.0.0.1:42001 0.0.0.0:*\n");
        let exchange = ScriptedExchange::by_port(routes(&[(42000, Scheme::Https, 200)]));
        let f = finder(runner, exchange);

        let discovery = f.try_detect().await;

        assert_eq!(
            discovery.connection,
            Some(ServerConnection {
                port: 42000,
                csrf_token: "mine-0123456789".to_string()
            })
        );
        let report = discovery.report;
        assert_eq!(report.failure_reason, None);
        assert_eq!(report.candidate_count, 2);
        assert_eq!(report.token_preview.as_deref(), Some("mine-012"));
        assert_eq!(report.ports_from_os, 1);
        assert_eq!(report.ports_from_cmdline, 1);
        assert_eq!(report.protocol_used, Some(Scheme::Https));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].port_source, PortSource::CommandLine);
    }

    #[tokio::test]
    async fn test_nephew_selected_via_parent_lookup() {
        let ps = "\
 6001   900 /ag/language_server_linux_x64 --csrf_token aaa --extension_server_port 43000
 6002   901 /ag/language_server_linux_x64 --csrf_token bbb --extension_server_port 43001
";
        let runner = FakeRunner::new()
            .route("ps -A", ps)
            .route("ppid= -p 900", "1\n")
            .route("ppid= -p 901", "100\n");
        let exchange = ScriptedExchange::by_port(routes(&[(43001, Scheme::Https, 200)]));
        let f = finder(runner, exchange);

        let discovery = f.try_detect().await;

        assert_eq!(discovery.connection.map(|c| c.csrf_token), Some("bbb".to_string()));
    }

    #[tokio::test]
    async fn test_ambiguous() {
        let ps = "\
 6001   900 /ag/language_server_linux_x64 --csrf_token aaa
 6002   901 /ag/language_server_linux_x64 --csrf_token bbb
";
        let runner = FakeRunner::new().route("ps -A", ps);
        let f = finder(runner, ScriptedExchange::by_port(HashMap::new()));

        let discovery = f.try_detect().await;

        assert_eq!(
            discovery.report.failure_reason,
            Some(DiscoveryFailure::Ambiguous)
        );
        assert_eq!(discovery.report.candidate_count, 2);
    }

    #[tokio::test]
    async fn test_auth_failed_when_any_probe_rejected() {
        let ps = " 7001 100 /ag/language_server_linux_x64 --csrf_token stale --extension_server_port 44000\n";
        let runner = FakeRunner::new()
            .route("ps -A", ps)
            .route("pid=7001", "LISTEN 0 4096 127.0.0.1:44001 0.0.0.0:*\n");
        let exchange = ScriptedExchange::by_port(routes(&[
            (44000, Scheme::Https, 403),
            (44001, Scheme::Https, 500),
        ]));
        let f = finder(runner, exchange);

        let discovery = f.try_detect().await;

        assert_eq!(discovery.connection, None);
        assert_eq!(
            discovery.report.failure_reason,
            Some(DiscoveryFailure::AuthFailed)
        );
        let statuses: Vec<u16> = discovery.report.attempts.iter().map(|a| a.status).collect();
        assert_eq!(statuses, vec![403, 500]);
        assert!(discovery.report.attempts.iter().all(|a| a.pid == 7001));
        assert_eq!(
            discovery.report.attempts[1].port_source,
            PortSource::PortScan
        );
    }

    #[tokio::test]
    async fn test_no_port_when_nothing_answers() {
        let ps = " 7001 100 /ag/language_server_linux_x64 --csrf_token t --extension_server_port 45000\n";
        let runner = FakeRunner::new().route("ps -A", ps);
        let f = finder(runner, ScriptedExchange::by_port(HashMap::new()));

        let discovery = f.try_detect().await;

        assert_eq!(discovery.report.failure_reason, Some(DiscoveryFailure::NoPort));
        assert_eq!(discovery.report.attempts.len(), 1);
        assert_eq!(discovery.report.attempts[0].status, 0);
    }

    #[tokio::test]
    async fn test_http_only_server_records_protocol() {
        let ps = " 7001 100 /ag/language_server_linux_x64 --csrf_token t --extension_server_port 46000\n";
        let runner = FakeRunner::new().route("ps -A", ps);
        let exchange = ScriptedExchange::by_port(routes(&[(46000, Scheme::Http, 200)]));
        let f = finder(runner, exchange);

        let discovery = f.try_detect().await;

        assert!(discovery.connection.is_some());
        assert_eq!(discovery.report.protocol_used, Some(Scheme::Http));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_reports_last_attempt_and_retry_count() {
        let f = finder(FakeRunner::new(), ScriptedExchange::by_port(HashMap::new()));

        let discovery = f.detect().await;

        assert_eq!(discovery.connection, None);
        assert_eq!(discovery.report.retry_count, 1);
        assert_eq!(
            discovery.report.failure_reason,
            Some(DiscoveryFailure::NoProcess)
        );
        assert_eq!(f.last_report().retry_count, 1);
    }
}
