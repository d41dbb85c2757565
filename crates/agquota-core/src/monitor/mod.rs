//! Orchestrates discovery, quota refresh, and cache checks.
//!
//! Startup is two-phase: [`Monitor::restore_from_cache`] loads the last
//! persisted view without any I/O beyond the state file, then
//! [`Monitor::start`] schedules the `refresh` and `cache_check` tasks.
//! Subscribers receive a [`MonitorSnapshot`] after every state change.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregate::{
    QuotaDisplayItem, QuotaHistory, QuotaViewModel, QuotaViewState, Severity, StatusBarData,
    UsageChartData,
};
use crate::config::Settings;
use crate::discovery::{Discovery, Platform, ProcessFinder, SystemRunner};
use crate::housekeeping::{CacheInfo, CacheService, CleanReport};
use crate::quota::{QuotaService, QuotaSnapshot};
use crate::scheduler::Scheduler;
use crate::state::{CacheDetails, PredictionRecord, StateStore};
use crate::transport::HttpTransport;
use crate::utils::format_bytes;

/// Task name of the quota refresh
pub const REFRESH_TASK: &str = "refresh";

/// Task name of the cache size check
pub const CACHE_CHECK_TASK: &str = "cache_check";

/// Minimum time between two oversized-cache warnings
const CACHE_WARNING_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// Everything a front end needs to render the current state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub state: QuotaViewState,
    pub status_bar: StatusBarData,
    pub severity: Severity,
    pub chart: UsageChartData,
    pub display_items: Vec<QuotaDisplayItem>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<u64>,
}

/// Result of one cache check
#[derive(Debug, Clone, PartialEq)]
pub struct CacheCheck {
    pub info: CacheInfo,
    /// The size crossed the warning threshold and a warning was emitted
    pub warned: bool,
    pub cleaned: Option<CleanReport>,
}

pub struct Monitor {
    settings: RwLock<Settings>,
    finder: ProcessFinder,
    quota: QuotaService,
    cache: CacheService,
    store: StateStore,
    view: Mutex<QuotaViewModel>,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    discovery_lock: tokio::sync::Mutex<()>,
    tx: watch::Sender<MonitorSnapshot>,
}

impl Monitor {
    /// Wire a monitor from its parts. History is seeded from the store.
    pub fn new(
        settings: Settings,
        finder: ProcessFinder,
        quota: QuotaService,
        cache: CacheService,
        store: StateStore,
    ) -> Self {
        let history = QuotaHistory::from_points(
            store.snapshot().history,
            settings.dashboard.history_range_minutes,
        );
        let view = QuotaViewModel::new(settings.group_strategy(), settings.view_options(), history);
        let snapshot = build_snapshot(&view, &settings, false, None, None);
        let (tx, _rx) = watch::channel(snapshot);

        Self {
            settings: RwLock::new(settings),
            finder,
            quota,
            cache,
            store,
            view: Mutex::new(view),
            consecutive_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
            discovery_lock: tokio::sync::Mutex::new(()),
            tx,
        }
    }

    /// Monitor talking to the real process table and language server
    pub fn from_settings(settings: Settings) -> Self {
        let transport = HttpTransport::loopback();
        let finder = ProcessFinder::new(
            Platform::current(),
            Arc::new(SystemRunner::default()),
            transport.clone(),
            settings.finder_options(),
        );
        let quota = QuotaService::new(
            transport,
            settings.system.server_host.as_str(),
            settings.system.api_path.as_str(),
        );
        let cache = CacheService::new(settings.cache_paths());
        let store = StateStore::open(settings.state_path());
        Self::new(settings, finder, quota, cache, store)
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> MonitorSnapshot {
        self.tx.borrow().clone()
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.quota.connection().is_some()
    }

    /// Load the last persisted view. Returns false when nothing was stored.
    pub fn restore_from_cache(&self) -> bool {
        let persisted = self.store.snapshot();
        let restored = self.view.lock().restore(
            persisted.last_view_state,
            persisted.last_snapshot,
            now_ms(),
        );
        if restored {
            debug!("Restored quota view from {:?}", self.store.path());
            self.publish();
        }
        restored
    }

    /// Run discovery and adopt the connection it finds
    pub async fn discover(&self) -> Discovery {
        let _guard = self.discovery_lock.lock().await;
        let discovery = self.finder.detect().await;

        match &discovery.connection {
            Some(connection) => {
                if self.quota.connection().as_ref() != Some(connection) {
                    info!("Connected to language server on port {}", connection.port);
                }
                self.quota.set_connection(connection.clone());
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.last_error.lock() = None;
            }
            None => {
                let reason = discovery
                    .report
                    .failure_reason
                    .map(|r| r.as_str())
                    .unwrap_or("unknown");
                *self.last_error.lock() = Some(format!("discovery failed: {}", reason));
            }
        }
        self.publish();
        discovery
    }

    /// One refresh cycle: discover if needed, fetch, aggregate, persist.
    ///
    /// Returns whether new quota data was applied. Expected failures are
    /// recorded and published; a malformed payload is returned as an error.
    pub async fn refresh(&self) -> Result<bool> {
        if !self.is_connected() && self.discover().await.connection.is_none() {
            return Ok(false);
        }

        match self.quota.fetch_quota().await {
            Ok(snapshot) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.last_error.lock() = None;
                self.apply_snapshot(snapshot);
                Ok(true)
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let threshold = self.settings.read().system.rediscover_after_failures;
                if threshold > 0 && failures >= threshold {
                    warn!(
                        "{} consecutive quota failures, rediscovering language server",
                        failures
                    );
                    self.quota.clear_connection();
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                }

                *self.last_error.lock() = Some(e.to_string());
                self.publish();

                if e.is_defect() {
                    return Err(e).context("Quota response could not be transformed");
                }
                Ok(false)
            }
        }
    }

    fn apply_snapshot(&self, snapshot: QuotaSnapshot) {
        let now = now_ms();
        let (state, percentage, prediction, history) = {
            let mut view = self.view.lock();
            view.update_from_snapshot(snapshot.clone(), now);
            (
                view.state().clone(),
                view.status_bar().primary.percentage,
                view.prediction().map(PredictionRecord::from),
                view.history().points().to_vec(),
            )
        };

        if let Err(e) = self.store.update(|s| {
            s.last_view_state = Some(state);
            s.last_snapshot = Some(snapshot);
            s.last_display_percentage = Some(percentage);
            s.last_prediction = prediction;
            s.history = history;
        }) {
            warn!("Failed to persist quota state: {:#}", e);
        }
        self.publish();
    }

    /// Measure the cache, warn when it is oversized, clean if configured
    pub async fn check_cache(&self) -> Result<CacheCheck> {
        let info = self.cache_info().await?;
        let (warning_bytes, auto_clean, keep_count) = {
            let settings = self.settings.read();
            (
                settings.cache_warning_bytes(),
                settings.cache.auto_clean,
                settings.cache.keep_count,
            )
        };

        let now = now_ms();
        let oversized = info.total_size > warning_bytes;
        let last_warning = self.store.snapshot().last_cache_warning_ms;
        let warned = oversized
            && last_warning.is_none_or(|at| now - at >= CACHE_WARNING_INTERVAL_MS);
        if warned {
            warn!(
                "Conversation cache is {} (limit {})",
                format_bytes(info.total_size),
                format_bytes(warning_bytes)
            );
        }

        let details = CacheDetails {
            brain: info.brain_size,
            conversations: info.conversations_size,
        };
        if let Err(e) = self.store.update(|s| {
            s.last_cache_size = Some(info.total_size);
            s.last_cache_details = Some(details);
            if warned {
                s.last_cache_warning_ms = Some(now);
            }
        }) {
            warn!("Failed to persist cache size: {:#}", e);
        }

        let cleaned = if oversized && auto_clean {
            Some(self.clean_cache(keep_count).await?)
        } else {
            None
        };
        self.publish();

        Ok(CacheCheck {
            info,
            warned,
            cleaned,
        })
    }

    pub async fn cache_info(&self) -> Result<CacheInfo> {
        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || cache.cache_info())
            .await
            .context("Cache scan task failed")
    }

    pub async fn clean_cache(&self, keep_count: usize) -> Result<CleanReport> {
        let cache = self.cache.clone();
        let report = tokio::task::spawn_blocking(move || cache.clean_cache(keep_count))
            .await
            .context("Cache clean task failed")?;

        let remaining = self.cache_info().await?;
        if let Err(e) = self.store.update(|s| {
            s.last_cache_size = Some(remaining.total_size);
            s.last_cache_details = Some(CacheDetails {
                brain: remaining.brain_size,
                conversations: remaining.conversations_size,
            });
        }) {
            warn!("Failed to persist cache size: {:#}", e);
        }
        Ok(report)
    }

    /// Register and start the `refresh` and `cache_check` tasks
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let (refresh_interval, scan_interval) = {
            let settings = self.settings.read();
            (settings.refresh_interval(), settings.cache_scan_interval())
        };

        let monitor = Arc::clone(self);
        scheduler.register(REFRESH_TASK, refresh_interval, true, move || {
            let monitor = Arc::clone(&monitor);
            async move { monitor.refresh().await.map(|_| ()) }
        });

        let monitor = Arc::clone(self);
        scheduler.register(CACHE_CHECK_TASK, scan_interval, true, move || {
            let monitor = Arc::clone(&monitor);
            async move { monitor.check_cache().await.map(|_| ()) }
        });

        scheduler.start(REFRESH_TASK);
        scheduler.start(CACHE_CHECK_TASK);
    }

    /// Apply changed settings to the view and the running schedule
    pub fn apply_settings(&self, mut settings: Settings, scheduler: Option<&Scheduler>) {
        settings.validate();
        let now = now_ms();
        {
            let mut view = self.view.lock();
            view.set_strategy(settings.group_strategy(), now);
            view.set_options(settings.view_options(), now);
        }
        if let Some(scheduler) = scheduler {
            scheduler.update_interval(REFRESH_TASK, settings.refresh_interval());
            scheduler.update_interval(CACHE_CHECK_TASK, settings.cache_scan_interval());
        }
        *self.settings.write() = settings;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = {
            let view = self.view.lock();
            let settings = self.settings.read();
            build_snapshot(
                &view,
                &settings,
                self.is_connected(),
                self.last_error.lock().clone(),
                self.store.snapshot().last_cache_size,
            )
        };
        self.tx.send_replace(snapshot);
    }
}

fn build_snapshot(
    view: &QuotaViewModel,
    settings: &Settings,
    connected: bool,
    last_error: Option<String>,
    cache_size: Option<u64>,
) -> MonitorSnapshot {
    let status_bar = view.status_bar();
    let severity = Severity::classify(
        f64::from(status_bar.primary.percentage),
        settings.status.warning_threshold,
        settings.status.critical_threshold,
    );
    MonitorSnapshot {
        state: view.state().clone(),
        status_bar,
        severity,
        chart: view.chart_data(),
        display_items: view.display_items().to_vec(),
        connected,
        last_error,
        cache_size,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::discovery::{FakeRunner, FinderOptions};
    use crate::housekeeping::CachePaths;
    use crate::retry::RetryPolicy;
    use crate::transport::testing::ScriptedExchange;
    use crate::transport::{ProtocolCache, RawResponse, Scheme};

    const PS_OUTPUT: &str = "  4242   100 /opt/ag/language_server_linux_x64 --extension_server_port=9100 --csrf_token=secret-token\n";

    fn user_status(remaining: f64) -> String {
        json!({
            "userStatus": {
                "cascadeModelConfigData": {
                    "clientModelConfigs": [{
                        "label": "Claude Sonnet 4.5",
                        "modelOrAlias": { "model": "MODEL_CLAUDE_4_5_SONNET" },
                        "quotaInfo": {
                            "remainingFraction": remaining,
                            "resetTime": "2099-01-01T00:00:00Z"
                        }
                    }]
                }
            }
        })
        .to_string()
    }

    fn monitor(dir: &Path, exchange: ScriptedExchange, settings: Settings) -> Monitor {
        let transport = HttpTransport::new(Arc::new(exchange), Arc::new(ProtocolCache::new()));
        let runner = FakeRunner::new().route("ps -A", PS_OUTPUT).route("ss -tlnp", "");
        let options = FinderOptions {
            policy: RetryPolicy::fixed(1, std::time::Duration::ZERO),
            ..FinderOptions::default()
        };
        let finder = ProcessFinder::new(Platform::Linux, Arc::new(runner), transport.clone(), options)
            .with_process_name("language_server_linux_x64");
        let quota = QuotaService::new(transport, "127.0.0.1", crate::quota::DEFAULT_API_PATH)
            .with_policy(RetryPolicy::fixed(1, std::time::Duration::ZERO));
        let cache = CacheService::new(CachePaths::under(dir));
        let store = StateStore::open(dir.join("state.json"));
        Monitor::new(settings, finder, quota, cache, store)
    }

    fn healthy_server(remaining: f64) -> ScriptedExchange {
        ScriptedExchange::by_port(HashMap::from([(
            9100,
            (Scheme::Https, 200, user_status(remaining)),
        )]))
    }

    #[tokio::test]
    async fn test_refresh_discovers_then_applies_snapshot() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path(), healthy_server(0.4), Settings::default());
        let mut rx = monitor.subscribe();

        assert!(monitor.refresh().await.unwrap());
        assert!(monitor.is_connected());

        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.state.group("claude").unwrap().remaining, 40.0);
        assert_eq!(snapshot.status_bar.primary.percentage, 40);
        assert!(snapshot.connected);
        assert!(snapshot.last_error.is_none());

        let persisted = StateStore::open(dir.path().join("state.json")).snapshot();
        assert_eq!(persisted.last_display_percentage, Some(40));
        assert_eq!(persisted.history.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_from_cache_before_refresh() {
        let dir = TempDir::new().unwrap();
        {
            let first = monitor(dir.path(), healthy_server(0.25), Settings::default());
            first.refresh().await.unwrap();
        }

        let offline = ScriptedExchange::by_port(HashMap::new());
        let second = monitor(dir.path(), offline, Settings::default());
        assert!(second.restore_from_cache());
        let snapshot = second.current();
        assert_eq!(snapshot.state.group("claude").unwrap().remaining, 25.0);
        assert!(!snapshot.connected);
    }

    #[tokio::test]
    async fn test_restore_with_empty_store() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path(), healthy_server(1.0), Settings::default());
        assert!(!monitor.restore_from_cache());
        assert_eq!(monitor.current().status_bar.primary.id, "unknown");
    }

    #[tokio::test]
    async fn test_discovery_failure_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let transport = HttpTransport::new(
            Arc::new(healthy_server(1.0)),
            Arc::new(ProtocolCache::new()),
        );
        let finder = ProcessFinder::new(
            Platform::Linux,
            Arc::new(FakeRunner::new()),
            transport.clone(),
            FinderOptions {
                policy: RetryPolicy::fixed(1, std::time::Duration::ZERO),
                ..FinderOptions::default()
            },
        );
        let monitor = Monitor::new(
            Settings::default(),
            finder,
            QuotaService::new(transport, "127.0.0.1", crate::quota::DEFAULT_API_PATH),
            CacheService::new(CachePaths::under(dir.path())),
            StateStore::open(dir.path().join("state.json")),
        );

        assert!(!monitor.refresh().await.unwrap());
        assert_eq!(
            monitor.current().last_error.as_deref(),
            Some("discovery failed: no_process")
        );
    }

    #[tokio::test]
    async fn test_rediscovers_after_repeated_failures() {
        let dir = TempDir::new().unwrap();
        // Handshake succeeds, quota calls are rejected
        let exchange = ScriptedExchange::new(|_, request| {
            if request.path.ends_with("GetUserStatus") {
                Ok(RawResponse {
                    status: 500,
                    body: "{}".to_string(),
                })
            } else {
                Ok(RawResponse {
                    status: 200,
                    body: "{}".to_string(),
                })
            }
        });
        let mut settings = Settings::default();
        settings.system.rediscover_after_failures = 2;
        let monitor = monitor(dir.path(), exchange, settings);

        assert!(!monitor.refresh().await.unwrap());
        assert!(monitor.is_connected());
        assert_eq!(
            monitor.current().last_error.as_deref(),
            Some("unexpected HTTP status 500")
        );

        assert!(!monitor.refresh().await.unwrap());
        assert!(!monitor.is_connected());
    }

    #[tokio::test]
    async fn test_check_cache_warns_once_and_cleans() {
        let dir = TempDir::new().unwrap();
        let paths = CachePaths::under(dir.path());
        for i in 0..3 {
            let task = paths.brain_dir.join(format!("task-{}", i));
            std::fs::create_dir_all(&task).unwrap();
            std::fs::write(task.join("task.md"), vec![b'x'; 600 * 1024]).unwrap();
        }

        let mut settings = Settings::default();
        settings.cache.warning_size_mb = 1;
        let monitor = monitor(dir.path(), healthy_server(1.0), settings.clone());

        let first = monitor.check_cache().await.unwrap();
        assert!(first.warned);
        assert!(first.cleaned.is_none());
        assert_eq!(first.info.brain_count, 3);

        let second = monitor.check_cache().await.unwrap();
        assert!(!second.warned);

        settings.cache.auto_clean = true;
        settings.cache.keep_count = 1;
        monitor.apply_settings(settings, None);
        let third = monitor.check_cache().await.unwrap();
        assert_eq!(third.cleaned.map(|r| r.deleted_count), Some(2));
        assert_eq!(monitor.current().cache_size, Some(600 * 1024));
    }
}
