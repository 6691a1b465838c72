/// Service configuration.
///
/// Loaded from a TOML file. Every section and field has a default, so a
/// partial file (or no file at all) still yields a runnable configuration.
/// `ConfigLoader` re-reads the file at the start of every tick; a file that
/// fails to parse is logged and the last good configuration stays in force.

use crate::model::Severity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest volume change the tank sensor can resolve, in gallons.
/// GPH windows below this delta are indistinguishable from noise.
pub const SENSOR_ACCURACY_GALLONS: f64 = 10.0;

/// Longest span any window, lookback or retention setting may cover.
pub const MAX_SPAN_HOURS: f64 = 24.0 * 366.0;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Tank poll / engine tick interval.
    pub tank_interval_secs: u64,
    /// Timeout for a single snapshot fetch.
    pub fetch_timeout_secs: u64,
    /// Minimum spacing between samples kept in the rolling history.
    pub history_sample_minutes: i64,
    /// How much rolling history the windowed detectors keep.
    pub history_retain_hours: i64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            tank_interval_secs: 60,
            fetch_timeout_secs: 30,
            history_sample_minutes: 15,
            history_retain_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Levels that alert when the tank falls through them.
    pub decreasing: Vec<f64>,
    /// Levels that alert when the tank fills through them.
    pub increasing: Vec<f64>,
    /// Distance back past a threshold required before it can fire again.
    pub dead_band_gallons: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            decreasing: vec![1000.0, 750.0, 500.0],
            increasing: vec![1300.0, 1450.0],
            dead_band_gallons: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagnationConfig {
    pub enabled: bool,
    /// Minimum flat-or-declining period before a rise counts as recovery.
    pub stagnation_hours: f64,
    pub recovery_threshold_gallons: f64,
    /// A low point older than this is discarded and a fresh one started.
    pub low_point_lookback_hours: f64,
}

impl Default for StagnationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stagnation_hours: 6.0,
            recovery_threshold_gallons: 50.0,
            low_point_lookback_hours: 48.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackflushConfig {
    pub enabled: bool,
    /// Local hour the overnight window opens (inclusive).
    pub window_start_hour: u32,
    /// Local hour the overnight window closes (exclusive). May wrap midnight.
    pub window_end_hour: u32,
    /// Offset of local time from UTC, in hours.
    pub utc_offset_hours: i32,
    pub threshold_gallons: f64,
    /// Number of history samples the drop is measured across.
    pub window_snapshots: usize,
}

impl Default for BackflushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_start_hour: 0,
            window_end_hour: 5,
            utc_offset_hours: 0,
            threshold_gallons: 50.0,
            window_snapshots: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HighFlowConfig {
    pub enabled: bool,
    pub window_hours: f64,
    pub averaging_count: usize,
    pub high_flow_gph: f64,
}

impl Default for HighFlowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_hours: 1.0,
            averaging_count: 3,
            high_flow_gph: 150.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideConfig {
    pub enabled: bool,
    /// Turn override on below this level. `None` disables auto-on.
    pub on_threshold: Option<f64>,
    /// Turn override off at or above this level.
    pub shutoff_threshold: f64,
    /// Consecutive failed tank reads before the safety shutoff.
    pub max_consecutive_failures: u32,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_threshold: None,
            shutoff_threshold: 1410.0,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GphConfig {
    pub lookback_days: i64,
    pub window_hours: f64,
    pub min_delta_gallons: f64,
    pub min_samples: usize,
    /// Fraction of the window that the samples must span.
    pub min_coverage: f64,
    pub cache_ttl_minutes: i64,
}

impl Default for GphConfig {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            window_hours: 6.0,
            min_delta_gallons: 20.0,
            min_samples: 4,
            min_coverage: 0.75,
            cache_ttl_minutes: 60,
        }
    }
}

impl GphConfig {
    /// Noise floor actually applied; never below the sensor's accuracy.
    pub fn effective_min_delta(&self) -> f64 {
        self.min_delta_gallons.max(SENSOR_ACCURACY_GALLONS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// A tank reading older than this is treated as a failed read.
    pub max_reading_age_minutes: u64,
    pub notify_pressure_changes: bool,
    pub notify_float_changes: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            max_reading_age_minutes: 30,
            notify_pressure_changes: true,
            notify_float_changes: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub min_severity: Severity,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            min_severity: Severity::Warning,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay bridge endpoint. Without one, commands are only logged.
    pub bridge_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bridge_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/snapshot".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: "tankmon_state.json".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll: PollConfig,
    pub thresholds: ThresholdConfig,
    pub stagnation: StagnationConfig,
    pub backflush: BackflushConfig,
    pub high_flow: HighFlowConfig,
    pub override_control: OverrideConfig,
    pub gph: GphConfig,
    pub sensors: SensorConfig,
    pub notify: NotifyConfig,
    pub relay: RelayConfig,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
    pub state: StateConfig,
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Repairs values that would otherwise make a rule misbehave.
    ///
    /// Nothing here is fatal: thresholds are sorted, bad values are clamped
    /// or the offending rule is disabled, and each repair is logged.
    pub fn normalize(&mut self) {
        normalize_thresholds("decreasing", &mut self.thresholds.decreasing);
        normalize_thresholds("increasing", &mut self.thresholds.increasing);

        if !(self.thresholds.dead_band_gallons >= 0.0) {
            tracing::error!(
                value = self.thresholds.dead_band_gallons,
                "invalid dead_band_gallons, using 0"
            );
            self.thresholds.dead_band_gallons = 0.0;
        }

        let ctl = &mut self.override_control;
        if ctl.max_consecutive_failures == 0 {
            tracing::error!("max_consecutive_failures must be at least 1, using 1");
            ctl.max_consecutive_failures = 1;
        }
        if let Some(on) = ctl.on_threshold {
            if !on.is_finite() || on >= ctl.shutoff_threshold {
                tracing::error!(
                    on_threshold = on,
                    shutoff_threshold = ctl.shutoff_threshold,
                    "on_threshold must be below shutoff_threshold, disabling auto-on"
                );
                ctl.on_threshold = None;
            }
        }

        if self.backflush.window_snapshots == 0 {
            tracing::error!("backflush.window_snapshots must be at least 1, using 1");
            self.backflush.window_snapshots = 1;
        }
        if self.backflush.window_start_hour > 23 || self.backflush.window_end_hour > 24 {
            tracing::error!(
                start = self.backflush.window_start_hour,
                end = self.backflush.window_end_hour,
                "backflush window hours out of range, disabling backflush detection"
            );
            self.backflush.enabled = false;
        }

        if self.high_flow.averaging_count == 0 {
            self.high_flow.averaging_count = 1;
        }
        if !(self.high_flow.window_hours > 0.0) {
            tracing::error!("high_flow.window_hours must be positive, disabling high-flow detection");
            self.high_flow.enabled = false;
        }

        if !(self.gph.window_hours > 0.0) {
            tracing::error!("gph.window_hours must be positive, using 6");
            self.gph.window_hours = 6.0;
        }
        if self.gph.min_delta_gallons < SENSOR_ACCURACY_GALLONS {
            tracing::warn!(
                configured = self.gph.min_delta_gallons,
                floor = SENSOR_ACCURACY_GALLONS,
                "gph.min_delta_gallons is below sensor accuracy, clamping"
            );
        }

        if self.poll.history_sample_minutes < 1 {
            self.poll.history_sample_minutes = 1;
        }

        if !(-12..=14).contains(&self.backflush.utc_offset_hours) {
            tracing::error!(
                utc_offset_hours = self.backflush.utc_offset_hours,
                "backflush.utc_offset_hours out of range, disabling backflush detection"
            );
            self.backflush.enabled = false;
        }

        clamp_hours("stagnation.stagnation_hours", &mut self.stagnation.stagnation_hours);
        clamp_hours(
            "stagnation.low_point_lookback_hours",
            &mut self.stagnation.low_point_lookback_hours,
        );
        clamp_hours("high_flow.window_hours", &mut self.high_flow.window_hours);
        clamp_hours("gph.window_hours", &mut self.gph.window_hours);

        let max_hours = MAX_SPAN_HOURS as i64;
        clamp_whole("gph.lookback_days", &mut self.gph.lookback_days, max_hours / 24);
        clamp_whole("gph.cache_ttl_minutes", &mut self.gph.cache_ttl_minutes, max_hours * 60);
        clamp_whole("poll.history_retain_hours", &mut self.poll.history_retain_hours, max_hours);
        clamp_whole(
            "poll.history_sample_minutes",
            &mut self.poll.history_sample_minutes,
            max_hours * 60,
        );
    }
}

/// Caps an hour setting at `MAX_SPAN_HOURS`. Non-finite values are capped too.
fn clamp_hours(field: &str, value: &mut f64) {
    if !(*value <= MAX_SPAN_HOURS) {
        tracing::error!(field, value = *value, max = MAX_SPAN_HOURS, "value too large, clamping");
        *value = MAX_SPAN_HOURS;
    }
}

fn clamp_whole(field: &str, value: &mut i64, max: i64) {
    if *value > max {
        tracing::error!(field, value = *value, max, "value too large, clamping");
        *value = max;
    }
}

/// Sorts a threshold list ascending, dropping non-finite values and duplicates.
fn normalize_thresholds(direction: &str, values: &mut Vec<f64>) {
    let before = values.len();
    values.retain(|v| v.is_finite());
    if values.len() != before {
        tracing::error!(direction, "dropped non-finite threshold values");
    }

    if !values.windows(2).all(|w| w[0] < w[1]) {
        tracing::warn!(direction, ?values, "threshold list not sorted, sorting");
        values.sort_by(|a, b| a.total_cmp(b));
        values.dedup();
    }
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// Re-reads the configuration file between ticks.
pub struct ConfigLoader {
    path: Option<PathBuf>,
    current: MonitorConfig,
}

impl ConfigLoader {
    /// Loads the initial configuration. A missing or broken file at startup
    /// is an error; later reload failures are not.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let current = MonitorConfig::load(&path)?;
        Ok(Self {
            path: Some(path),
            current,
        })
    }

    /// A loader that never touches disk.
    pub fn fixed(config: MonitorConfig) -> Self {
        Self {
            path: None,
            current: config,
        }
    }

    pub fn current(&self) -> &MonitorConfig {
        &self.current
    }

    /// Re-reads the file and returns the configuration for this tick.
    pub fn reload(&mut self) -> &MonitorConfig {
        if let Some(path) = &self.path {
            match MonitorConfig::load(path) {
                Ok(fresh) => {
                    if fresh != self.current {
                        tracing::info!(path = %path.display(), "configuration reloaded");
                        self.current = fresh;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "config reload failed, keeping previous configuration");
                }
            }
        }
        &self.current
    }
}
