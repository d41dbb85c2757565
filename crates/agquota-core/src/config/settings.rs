use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::aggregate::{default_groups, GroupStrategy, QuotaGroup, ViewMode, ViewOptions};
use crate::discovery::{FinderOptions, DEFAULT_HANDSHAKE_PATH, PROBE_TIMEOUT};
use crate::housekeeping::CachePaths;
use crate::quota::DEFAULT_API_PATH;
use crate::retry::RetryPolicy;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Antigravity quota monitor")]
pub struct Config {
    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Quota refresh interval in seconds
    #[arg(short = 'r', long, global = true)]
    pub refresh_secs: Option<u64>,

    /// Language server host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll quota until interrupted (default)
    Run {
        /// Print each refresh as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fetch quota once and print it
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run language server discovery and print the report
    Diagnose,
    /// Inspect or clean the conversation cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    /// Show cache sizes and items
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Delete all but the newest tasks
    Clean {
        /// Number of tasks to keep (defaults to cache.keep_count)
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

impl Config {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Subcommand to run, `run` when none was given
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { json: false })
    }
}

/// Application settings (from config file)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub dashboard: DashboardSettings,

    #[serde(default)]
    pub status: StatusSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub system: SystemSettings,

    /// Retry policy for language server discovery
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Quota groups in display order (empty means built-in groups)
    #[serde(default)]
    pub groups: Vec<QuotaGroup>,

    /// Group receiving models no other group matches
    #[serde(default)]
    pub default_group: Option<String>,

    /// Persisted state file override
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

/// Quota dashboard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSettings {
    #[serde(default)]
    pub view_mode: ViewMode,

    /// Usage history window for charts and prediction
    #[serde(default = "default_history_range")]
    pub history_range_minutes: u64,

    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Show the secondary (shared pool) group in model lists and charts
    #[serde(default)]
    pub include_secondary_models: bool,

    #[serde(default = "default_secondary_group")]
    pub secondary_group: String,
}

fn default_history_range() -> u64 {
    90
}

fn default_refresh_secs() -> u64 {
    120
}

fn default_secondary_group() -> String {
    "gpt".to_string()
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            view_mode: ViewMode::default(),
            history_range_minutes: default_history_range(),
            refresh_secs: default_refresh_secs(),
            include_secondary_models: false,
            secondary_group: default_secondary_group(),
        }
    }
}

/// What the status line shows for the primary group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayFormat {
    #[default]
    Percentage,
    ResetTime,
    Used,
    Remaining,
}

/// Status line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    #[serde(default = "default_true")]
    pub show_quota: bool,

    #[serde(default = "default_true")]
    pub show_cache: bool,

    #[serde(default)]
    pub display_format: DisplayFormat,

    /// Remaining percentage at or below which the status is a warning
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
}

fn default_true() -> bool {
    true
}

fn default_warning_threshold() -> f64 {
    30.0
}

fn default_critical_threshold() -> f64 {
    10.0
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            show_quota: true,
            show_cache: true,
            display_format: DisplayFormat::default(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

/// Cache housekeeping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Clean automatically when the cache exceeds the warning size
    #[serde(default)]
    pub auto_clean: bool,

    /// Brain tasks kept by a clean
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,

    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    #[serde(default = "default_warning_size")]
    pub warning_size_mb: u64,

    #[serde(default)]
    pub brain_dir: Option<PathBuf>,

    #[serde(default)]
    pub conversations_dir: Option<PathBuf>,

    #[serde(default)]
    pub code_contexts_dir: Option<PathBuf>,
}

fn default_keep_count() -> usize {
    5
}

fn default_scan_interval() -> u64 {
    120
}

fn default_warning_size() -> u64 {
    500
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            auto_clean: false,
            keep_count: default_keep_count(),
            scan_interval_secs: default_scan_interval(),
            warning_size_mb: default_warning_size(),
            brain_dir: None,
            conversations_dir: None,
            code_contexts_dir: None,
        }
    }
}

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default = "default_server_host")]
    pub server_host: String,

    #[serde(default = "default_api_path")]
    pub api_path: String,

    #[serde(default = "default_handshake_path")]
    pub handshake_path: String,

    #[serde(default)]
    pub debug_mode: bool,

    /// Consecutive failed refreshes before discovery runs again (0 disables)
    #[serde(default = "default_rediscover_after")]
    pub rediscover_after_failures: u32,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_path() -> String {
    DEFAULT_API_PATH.to_string()
}

fn default_handshake_path() -> String {
    DEFAULT_HANDSHAKE_PATH.to_string()
}

fn default_rediscover_after() -> u32 {
    3
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            api_path: default_api_path(),
            handshake_path: default_handshake_path(),
            debug_mode: false,
            rediscover_after_failures: default_rediscover_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_discovery_attempts")]
    pub attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_discovery_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1500
}

fn default_max_delay() -> u64 {
    10_000
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            attempts: default_discovery_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Settings {
    /// Load settings from config file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        // Try custom path first
        if let Some(p) = path {
            if p.exists() {
                return Self::from_file(p);
            }
        }

        // Try default config locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("agquota/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/agquota/config.toml")),
            dirs::home_dir().map(|p| p.join(".agquota.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        // Return defaults if no config file found
        Ok(Self::default())
    }

    fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Merge CLI config into settings (CLI takes precedence)
    pub fn merge_cli(&mut self, cli: &Config) {
        if let Some(refresh_secs) = cli.refresh_secs {
            self.dashboard.refresh_secs = refresh_secs;
        }
        if let Some(host) = &cli.host {
            self.system.server_host = host.clone();
        }
        if cli.debug {
            self.system.debug_mode = true;
        }
    }

    /// Validate and normalize settings values
    ///
    /// The language server is polled no more than once a minute and the
    /// cache scanned no more than every 30 seconds.
    pub fn validate(&mut self) {
        const MIN_REFRESH_SECS: u64 = 60;
        const MIN_SCAN_INTERVAL_SECS: u64 = 30;
        const MIN_HISTORY_RANGE: u64 = 1;

        if self.dashboard.refresh_secs < MIN_REFRESH_SECS {
            self.dashboard.refresh_secs = MIN_REFRESH_SECS;
        }
        if self.cache.scan_interval_secs < MIN_SCAN_INTERVAL_SECS {
            self.cache.scan_interval_secs = MIN_SCAN_INTERVAL_SECS;
        }
        if self.dashboard.history_range_minutes < MIN_HISTORY_RANGE {
            self.dashboard.history_range_minutes = MIN_HISTORY_RANGE;
        }
        if self.discovery.attempts == 0 {
            self.discovery.attempts = 1;
        }
    }

    pub fn view_options(&self) -> ViewOptions {
        ViewOptions {
            view_mode: self.dashboard.view_mode,
            history_range_minutes: self.dashboard.history_range_minutes,
            refresh_secs: self.dashboard.refresh_secs,
            include_secondary_models: self.dashboard.include_secondary_models,
            secondary_group: self.dashboard.secondary_group.clone(),
        }
    }

    pub fn finder_options(&self) -> FinderOptions {
        FinderOptions {
            host: self.system.server_host.clone(),
            handshake_path: self.system.handshake_path.clone(),
            probe_timeout: PROBE_TIMEOUT,
            policy: RetryPolicy::exponential(
                self.discovery.attempts,
                Duration::from_millis(self.discovery.base_delay_ms),
                Duration::from_millis(self.discovery.max_delay_ms),
            ),
        }
    }

    pub fn group_strategy(&self) -> GroupStrategy {
        let groups = if self.groups.is_empty() {
            default_groups()
        } else {
            self.groups.clone()
        };
        GroupStrategy::new(groups, self.default_group.as_deref())
    }

    /// Cache directories, with overrides applied over the IDE defaults
    pub fn cache_paths(&self) -> CachePaths {
        let root = CachePaths::default_root().unwrap_or_else(|| PathBuf::from(".gemini/antigravity"));
        let defaults = CachePaths::under(&root);
        CachePaths {
            brain_dir: self.cache.brain_dir.clone().unwrap_or(defaults.brain_dir),
            conversations_dir: self
                .cache
                .conversations_dir
                .clone()
                .unwrap_or(defaults.conversations_dir),
            code_contexts_dir: self
                .cache
                .code_contexts_dir
                .clone()
                .unwrap_or(defaults.code_contexts_dir),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(crate::state::default_path)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.dashboard.refresh_secs)
    }

    pub fn cache_scan_interval(&self) -> Duration {
        Duration::from_secs(self.cache.scan_interval_secs)
    }

    pub fn cache_warning_bytes(&self) -> u64 {
        self.cache.warning_size_mb.saturating_mul(1024 * 1024)
    }
}
