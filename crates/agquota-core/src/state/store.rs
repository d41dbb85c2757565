use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::{HistoryPoint, Prediction, QuotaViewState};
use crate::quota::QuotaSnapshot;

/// Overrides the directory holding `state.json`
pub const STATE_DIR_ENV: &str = "AGQUOTA_STATE_DIR";

const STATE_FILE: &str = "state.json";

/// Last measured size of each cache directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDetails {
    pub brain: u64,
    pub conversations: u64,
}

/// Last shown prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRecord {
    pub usage_rate: f64,
    pub runway: String,
    pub group_id: String,
}

impl From<&Prediction> for PredictionRecord {
    fn from(prediction: &Prediction) -> Self {
        Self {
            usage_rate: prediction.usage_rate,
            runway: prediction.runway.clone(),
            group_id: prediction.group_id.clone(),
        }
    }
}

/// Everything restored on startup before the first fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    pub last_view_state: Option<QuotaViewState>,
    pub last_snapshot: Option<QuotaSnapshot>,
    pub last_cache_size: Option<u64>,
    pub last_cache_details: Option<CacheDetails>,
    pub last_display_percentage: Option<u8>,
    pub last_prediction: Option<PredictionRecord>,
    /// Epoch milliseconds of the last oversized-cache warning
    pub last_cache_warning_ms: Option<i64>,
    pub history: Vec<HistoryPoint>,
}

/// Default location: `$AGQUOTA_STATE_DIR/state.json`, else the platform
/// data directory
pub fn default_path() -> PathBuf {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join(STATE_FILE);
    }
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("agquota")
        .join(STATE_FILE)
}

/// JSON-file backed key-value store
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: RwLock<PersistedState>,
    /// Held from mutation through rename; writers share one temp path
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Open the store. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match read_state(&path) {
            Ok(Some(state)) => state,
            Ok(None) => PersistedState::default(),
            Err(e) => {
                warn!("Ignoring persisted state: {:#}", e);
                PersistedState::default()
            }
        };
        Self {
            path,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.read().clone()
    }

    /// Apply `f` to the state and write it to disk
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PersistedState),
    {
        let _write = self.write_lock.lock();
        let state = {
            let mut guard = self.state.write();
            f(&mut guard);
            guard.clone()
        };
        write_state(&self.path, &state)
    }

    pub fn save(&self) -> Result<()> {
        let _write = self.write_lock.lock();
        write_state(&self.path, &self.snapshot())
    }
}

fn read_state(path: &Path) -> Result<Option<PersistedState>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read state file: {:?}", path)),
    };
    let state = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {:?}", path))?;
    Ok(Some(state))
}

/// Write through a temp file and rename so readers never see a partial file
fn write_state(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {:?}", dir))?;
    }

    let json = serde_json::to_string(state).context("Failed to serialize state")?;
    let temp_path = path.with_extension("json.tmp");
    let _ = fs::remove_file(&temp_path);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp state file: {:?}", temp_path))?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("Failed to write temp state file: {:?}", temp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp state file: {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename state file: {:?}", path))?;
    debug!("Persisted state to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::aggregate::QuotaGroupState;

    fn sample_view_state() -> QuotaViewState {
        QuotaViewState {
            groups: vec![QuotaGroupState {
                id: "claude".to_string(),
                label: "Claude".to_string(),
                remaining: 42.0,
                reset_time: "1h 5m".to_string(),
                theme_color: "#D97757".to_string(),
                has_data: true,
            }],
            active_group_id: "claude".to_string(),
            last_updated: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.json"));
        assert_eq!(store.snapshot(), PersistedState::default());
    }

    #[test]
    fn test_update_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::open(&path);

        store
            .update(|state| {
                state.last_view_state = Some(sample_view_state());
                state.last_cache_size = Some(1024);
                state.last_cache_details = Some(CacheDetails {
                    brain: 1000,
                    conversations: 24,
                });
                state.last_display_percentage = Some(42);
                state.last_prediction = Some(PredictionRecord {
                    usage_rate: 12.5,
                    runway: "~3h".to_string(),
                    group_id: "claude".to_string(),
                });
                state.history.push(HistoryPoint {
                    timestamp: 1_700_000_000_000,
                    usage: BTreeMap::from([("claude".to_string(), 42.0)]),
                });
            })
            .unwrap();

        let reopened = StateStore::open(&path);
        assert_eq!(reopened.snapshot(), store.snapshot());
        assert_eq!(reopened.snapshot().last_display_percentage, Some(42));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let store = StateStore::open(&path);
        assert_eq!(store.snapshot(), PersistedState::default());

        store.update(|s| s.last_cache_warning_ms = Some(5)).unwrap();
        assert_eq!(StateStore::open(&path).snapshot().last_cache_warning_ms, Some(5));
    }

    #[test]
    fn test_unknown_and_missing_fields_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"lastCacheSize": 77, "somethingElse": true}"#).unwrap();

        let state = StateStore::open(&path).snapshot();
        assert_eq!(state.last_cache_size, Some(77));
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_concurrent_updates_all_land() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = std::sync::Arc::new(StateStore::open(&path));

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        store
                            .update(|s| s.last_cache_size = Some(s.last_cache_size.unwrap_or(0) + 1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.snapshot().last_cache_size, Some(400));
        assert_eq!(StateStore::open(&path).snapshot().last_cache_size, Some(400));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_default_path_env_override() {
        temp_env::with_var(STATE_DIR_ENV, Some("/tmp/agquota-test-state"), || {
            assert_eq!(
                default_path(),
                PathBuf::from("/tmp/agquota-test-state/state.json")
            );
        });
        temp_env::with_var(STATE_DIR_ENV, None::<&str>, || {
            assert!(default_path().ends_with("agquota/state.json"));
        });
    }
}
