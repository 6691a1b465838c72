//! Durable engine state.
//!
//! Everything the detectors and the override controller must remember
//! across ticks and restarts lives in one `PersistentState` value, stored as
//! a single JSON document. Loading never fails: a missing file yields
//! defaults, and a corrupt entry resets only that entry. Saving writes a
//! temporary file and renames it over the old one, so a crash mid-write
//! leaves the previous state intact.
//!
//! The state file is single-writer. `StateStore::open` takes an advisory
//! lock on `<state>.lock` and holds it for the life of the store, so a
//! second instance pointed at the same file fails at startup.

use crate::analysis::window::ReadingHistory;
use crate::model::{FloatState, RelayState};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Persisted entities
// ---------------------------------------------------------------------------

/// Idempotency marker for one rule instance.
///
/// `last_fired_value` is set when the rule fires and cleared when the rule
/// re-arms. While it is set, the rule stays silent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupMarker {
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_fired_value: Option<f64>,
}

impl DedupMarker {
    pub fn is_armed(&self) -> bool {
        self.last_fired_value.is_none()
    }

    pub fn fire(&mut self, at: DateTime<Utc>, value: f64) {
        self.last_fired_at = Some(at);
        self.last_fired_value = Some(value);
    }

    pub fn rearm(&mut self) {
        self.last_fired_value = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagnationState {
    pub low_point_timestamp: Option<DateTime<Utc>>,
    pub low_point_gallons: Option<f64>,
    pub recovery_alerted_for_low_point: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackflushState {
    /// Tick time of the last backflush event.
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_drop_started_at: Option<DateTime<Utc>>,
    /// Tank level when the last event fired.
    pub last_event_gallons: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureCounter {
    pub consecutive_failures: u32,
    /// Set once the failure gate has acted for the current outage.
    pub safety_triggered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorState {
    pub last_pressure_high: Option<bool>,
    pub last_float_state: Option<FloatState>,
}

/// All state carried between ticks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentState {
    /// Keyed by `threshold_key(direction, value)`.
    pub thresholds: BTreeMap<String, DedupMarker>,
    pub last_gallons: Option<f64>,
    pub stagnation: StagnationState,
    pub backflush: BackflushState,
    pub high_flow: DedupMarker,
    pub failures: FailureCounter,
    pub relays: RelayState,
    pub sensors: SensorState,
    pub recent_readings: ReadingHistory,
}

impl PersistentState {
    /// Decodes a state document, resetting any entry that fails to parse.
    ///
    /// Unknown keys are ignored and missing keys take their defaults.
    pub fn from_json_lenient(text: &str) -> Self {
        let mut map = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::warn!("state file is not a JSON object, starting from defaults");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(error = %e, "state file unreadable, starting from defaults");
                return Self::default();
            }
        };

        PersistentState {
            thresholds: take_entry(&mut map, "thresholds"),
            last_gallons: take_entry(&mut map, "last_gallons"),
            stagnation: take_entry(&mut map, "stagnation"),
            backflush: take_entry(&mut map, "backflush"),
            high_flow: take_entry(&mut map, "high_flow"),
            failures: take_entry(&mut map, "failures"),
            relays: take_entry(&mut map, "relays"),
            sensors: take_entry(&mut map, "sensors"),
            recent_readings: take_entry(&mut map, "recent_readings"),
        }
    }
}

fn take_entry<T: DeserializeOwned + Default>(map: &mut Map<String, Value>, key: &str) -> T {
    match map.remove(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "corrupt state entry reset to default");
            T::default()
        }),
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file {path} is locked by another process")]
    Locked { path: String },
    #[error("state I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct StateStore {
    path: PathBuf,
    _lock: File,
}

impl StateStore {
    /// Opens the store at `path`, taking the single-writer lock.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| io_error(&lock_path, source))?;

        match lock.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(StateError::Locked {
                    path: path.display().to_string(),
                });
            }
            Err(TryLockError::Error(source)) => return Err(io_error(&lock_path, source)),
        }

        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state, falling back to defaults. Never fails.
    pub fn load(&self) -> PersistentState {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let state = PersistentState::from_json_lenient(&text);
                tracing::info!(path = %self.path.display(), "state loaded");
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no state file, starting fresh");
                PersistentState::default()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "state file unreadable, starting fresh");
                PersistentState::default()
            }
        }
    }

    /// Atomically replaces the state file with `state`.
    pub fn save(&self, state: &PersistentState) -> Result<(), StateError> {
        let body = serde_json::to_vec_pretty(state)?;
        let tmp = sibling(&self.path, "tmp");

        let mut file = File::create(&tmp).map_err(|source| io_error(&tmp, source))?;
        file.write_all(&body).map_err(|source| io_error(&tmp, source))?;
        file.sync_all().map_err(|source| io_error(&tmp, source))?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(|source| io_error(&self.path, source))?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn io_error(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        source,
    }
}
