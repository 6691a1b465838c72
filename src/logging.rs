/// Structured logging for the tank monitoring service
///
/// Wraps `tracing` with the service's component tags and failure
/// classification. `init_logging` installs a console subscriber and, when
/// configured, an append-only log file for daemon operation.

use crate::model::{Event, Severity, SourceError};
use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Source,
    Engine,
    Relay,
    Notify,
    State,
    Archive,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Source => write!(f, "SRC"),
            Component::Engine => write!(f, "ENG"),
            Component::Relay => write!(f, "RLY"),
            Component::Notify => write!(f, "NTF"),
            Component::State => write!(f, "STATE"),
            Component::Archive => write!(f, "DB"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - sensor bridge briefly unreachable, tank scrape empty
    Expected,
    /// Unexpected failure - indicates a bridge fault or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify a snapshot fetch failure.
///
/// Timeouts and connection errors are routine on a rural link and are
/// already counted by the failure gate, so they only log at debug.
pub fn classify_source_failure(err: &SourceError) -> FailureType {
    match err {
        SourceError::Http(e) if e.is_timeout() || e.is_connect() => FailureType::Expected,
        SourceError::NoData(_) => FailureType::Expected,
        SourceError::Status(code) if *code >= 500 => FailureType::Unknown,
        SourceError::Status(_) | SourceError::Parse(_) => FailureType::Unexpected,
        SourceError::Http(_) | SourceError::Archive(_) => FailureType::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Subscriber setup
// ---------------------------------------------------------------------------

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
///
/// Returns an error only if the log file cannot be opened; the console
/// layer is installed regardless.
pub fn init_logging(default_level: &str, log_file: Option<&str>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, file_err) = match log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                ),
                None,
            ),
            Err(e) => (None, Some(e)),
        },
        None => (None, None),
    };

    // A second init (e.g. from tests) is harmless; keep the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init();

    match file_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a snapshot fetch failure with automatic classification
pub fn log_source_failure(operation: &str, err: &SourceError) {
    let failure_type = classify_source_failure(err);
    let component = Component::Source;

    match failure_type {
        FailureType::Expected => {
            tracing::debug!(%component, operation, class = %failure_type, error = %err, "fetch failed")
        }
        FailureType::Unexpected => {
            tracing::error!(%component, operation, class = %failure_type, error = %err, "fetch failed")
        }
        FailureType::Unknown => {
            tracing::warn!(%component, operation, class = %failure_type, error = %err, "fetch failed")
        }
    }
}

/// Log an event at a level matching its severity.
pub fn log_event(event: &Event) {
    let component = Component::Engine;
    let kind = event.kind.name();
    match event.severity {
        Severity::Info => tracing::info!(%component, kind, message = %event.message, "event"),
        Severity::Warning => tracing::warn!(%component, kind, message = %event.message, "event"),
        Severity::Urgent => tracing::error!(%component, kind, message = %event.message, "event"),
    }
}

/// One line per tick so gaps in the log line up with gaps in the data.
pub fn log_tick_summary(gallons: Option<f64>, events: usize, commands: usize, failures: u32) {
    let component = Component::Engine;
    match gallons {
        Some(g) => tracing::info!(%component, gallons = g, events, commands, "tick complete"),
        None => tracing::warn!(
            %component,
            events,
            commands,
            consecutive_failures = failures,
            "tick complete without tank reading"
        ),
    }
}
