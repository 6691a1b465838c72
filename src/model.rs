/// Core data types for the tank monitoring service.
///
/// This module defines the shared domain model imported by all other modules:
/// the per-tick `Snapshot`, the `Event`s handed to dispatchers, the
/// `RelayCommand`s handed to the relay bridge, and the collaborator error
/// types. It contains no decision logic and no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// State of the tank float switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FloatState {
    /// Tank is full; the float is lifted.
    Full,
    /// Float has dropped and is calling for water.
    Calling,
}

impl fmt::Display for FloatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloatState::Full => write!(f, "FULL"),
            FloatState::Calling => write!(f, "CALLING"),
        }
    }
}

/// One observation of the water system, produced externally once per tick.
///
/// `tank_gallons` is `None` whenever the tank scrape failed. Relay booleans
/// are the physical state read back from the relay board, not what this
/// service last commanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub tank_gallons: Option<f64>,
    /// When the tank sensor itself took the reading, if the source reports it.
    #[serde(default)]
    pub tank_reading_at: Option<DateTime<Utc>>,
    pub pressure_high: bool,
    pub float_state: FloatState,
    pub relay_override: bool,
    pub relay_bypass: bool,
    #[serde(default)]
    pub tank_read_failed: bool,
}

impl Snapshot {
    /// Placeholder used for a tick where the snapshot source itself failed.
    ///
    /// Relay booleans are carried over from the last persisted state so the
    /// controller still knows whether the override valve may be open.
    pub fn unavailable(now: DateTime<Utc>, relays: &RelayState) -> Self {
        Snapshot {
            timestamp: now,
            tank_gallons: None,
            tank_reading_at: None,
            pressure_high: false,
            float_state: FloatState::Calling,
            relay_override: relays.override_on,
            relay_bypass: relays.bypass,
            tank_read_failed: true,
        }
    }

    /// Tank level usable by detectors, or `None` for a failed or nonsense read.
    pub fn gallons(&self) -> Option<f64> {
        if self.tank_read_failed {
            return None;
        }
        self.tank_gallons.filter(|g| g.is_finite() && *g >= 0.0)
    }

    pub fn relays(&self) -> RelayState {
        RelayState {
            override_on: self.relay_override,
            bypass: self.relay_bypass,
        }
    }
}

// ---------------------------------------------------------------------------
// Relay types
// ---------------------------------------------------------------------------

/// Persisted relay positions, restored verbatim on restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayState {
    #[serde(rename = "override")]
    pub override_on: bool,
    pub bypass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayTarget {
    Override,
    Bypass,
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayTarget::Override => write!(f, "override"),
            RelayTarget::Bypass => write!(f, "bypass"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayAction {
    On,
    Off,
}

impl fmt::Display for RelayAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayAction::On => write!(f, "on"),
            RelayAction::Off => write!(f, "off"),
        }
    }
}

/// A single relay transition requested by the override controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayCommand {
    pub target: RelayTarget,
    pub action: RelayAction,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event severity, in ascending order of urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Urgent,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Urgent => write!(f, "urgent"),
        }
    }
}

/// Direction of travel for a threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Decreasing,
    Increasing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Decreasing => write!(f, "decreasing"),
            Direction::Increasing => write!(f, "increasing"),
        }
    }
}

/// What happened, with the data a human needs to act on it.
///
/// Serialized internally tagged so the dispatcher sees a flat
/// `{"kind": "...", ...payload}` object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ThresholdCrossed {
        direction: Direction,
        threshold: f64,
        gallons: f64,
    },
    WellRecovered {
        low_point_at: DateTime<Utc>,
        low_point_gallons: f64,
        gallons: f64,
    },
    Backflush {
        drop_gallons: f64,
        started_at: DateTime<Utc>,
    },
    HighFlow {
        gallons_per_hour: f64,
        threshold_gph: f64,
    },
    OverrideOn {
        gallons: f64,
        threshold: f64,
    },
    OverrideOff {
        gallons: f64,
        threshold: f64,
    },
    SafetyShutoff {
        consecutive_failures: u32,
    },
    TankReadingsUnavailable {
        consecutive_failures: u32,
    },
    TankReadingsRestored {
        after_failures: u32,
    },
    RelayActuationFailed {
        target: RelayTarget,
        action: RelayAction,
        error: String,
    },
    PressureChanged {
        pressure_high: bool,
    },
    FloatChanged {
        float_state: FloatState,
    },
}

impl EventKind {
    /// Stable kind string, matching the serialized `kind` tag.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ThresholdCrossed { .. } => "threshold_crossed",
            EventKind::WellRecovered { .. } => "well_recovered",
            EventKind::Backflush { .. } => "backflush",
            EventKind::HighFlow { .. } => "high_flow",
            EventKind::OverrideOn { .. } => "override_on",
            EventKind::OverrideOff { .. } => "override_off",
            EventKind::SafetyShutoff { .. } => "safety_shutoff",
            EventKind::TankReadingsUnavailable { .. } => "tank_readings_unavailable",
            EventKind::TankReadingsRestored { .. } => "tank_readings_restored",
            EventKind::RelayActuationFailed { .. } => "relay_actuation_failed",
            EventKind::PressureChanged { .. } => "pressure_changed",
            EventKind::FloatChanged { .. } => "float_changed",
        }
    }
}

/// A write-once notification handed to the event dispatchers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        severity: Severity,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event {
            kind,
            severity,
            message: message.into(),
            timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from fetching a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Transport failure, including the fetch timeout.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-2xx response from the sensor bridge.
    #[error("HTTP error: {0}")]
    Status(u16),
    /// The response body could not be turned into a snapshot.
    #[error("Parse error: {0}")]
    Parse(String),
    /// The source has nothing to return (e.g. replay ran past its data).
    #[error("No data available: {0}")]
    NoData(String),
    #[error("Archive error: {0}")]
    Archive(String),
}

/// Errors from driving a relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay bridge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay bridge rejected {target} {action}: HTTP {status}")]
    Rejected {
        target: RelayTarget,
        action: RelayAction,
        status: u16,
    },
    #[error("relay hardware write failed: {0}")]
    Hardware(String),
}

/// Errors from delivering an event.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned HTTP {0}")]
    Status(u16),
}

/// Anything that can abort a tick. Caught at the tick boundary and logged.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    State(#[from] crate::state::StateError),
    #[error(transparent)]
    Archive(#[from] crate::db::ArchiveError),
    #[error(transparent)]
    Source(#[from] SourceError),
}
