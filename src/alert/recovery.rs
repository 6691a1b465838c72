//! Well recovery after stagnation.
//!
//! When the well runs low the tank stops filling and drifts down with
//! household use. The detector tracks that low point and alerts once when
//! the level has rebounded by `recovery_threshold_gallons`, provided the
//! low point is at least `stagnation_hours` old.
//!
//! ```text
//!   QUIET ──(flat/declining for stagnation_hours)──► STAGNATING(low)
//!   STAGNATING(low) ──(level <= low)──► STAGNATING(new low)
//!   STAGNATING(low) ──(rebound >= threshold, age >= stagnation_hours)──► RECOVERED
//!   RECOVERED ──(level <= low, or low point expires)──► STAGNATING / QUIET
//! ```
//!
//! An equal reading moves the low point's timestamp forward, so the
//! stagnation period is measured from the last time the tank sat at the
//! minimum. A low point alerts at most once. Small dips that stay above it do not
//! establish a new low point, so they cannot re-fire the same recovery.

use crate::analysis::window::{ReadingHistory, hours};
use crate::config::{SENSOR_ACCURACY_GALLONS, StagnationConfig};
use crate::model::{Event, EventKind, Severity};
use crate::state::StagnationState;
use chrono::{DateTime, Utc};

/// Where the detector currently stands, derived from the persisted state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryPhase {
    Quiet,
    Stagnating { low_point_gallons: f64 },
    Recovered { low_point_gallons: f64 },
}

pub fn phase(state: &StagnationState) -> RecoveryPhase {
    match state.low_point_gallons {
        None => RecoveryPhase::Quiet,
        Some(low) if state.recovery_alerted_for_low_point => RecoveryPhase::Recovered {
            low_point_gallons: low,
        },
        Some(low) => RecoveryPhase::Stagnating {
            low_point_gallons: low,
        },
    }
}

/// Feeds one tank reading through the recovery state machine.
///
/// `history` holds the samples from before this tick; it is only consulted
/// to decide whether a first low point can be established.
pub fn check_recovery(
    gallons: f64,
    now: DateTime<Utc>,
    history: &ReadingHistory,
    config: &StagnationConfig,
    state: &mut StagnationState,
) -> Option<Event> {
    if !config.enabled {
        return None;
    }

    if let Some(low_at) = state.low_point_timestamp {
        if now - low_at > hours(config.low_point_lookback_hours) {
            tracing::debug!(low_point_at = %low_at, "low point expired");
            *state = StagnationState::default();
        }
    }

    let (low_at, low) = match (state.low_point_timestamp, state.low_point_gallons) {
        (Some(at), Some(g)) => (at, g),
        _ => {
            if flat_or_declining(gallons, now, history, config.stagnation_hours) {
                tracing::info!(gallons, "stagnation detected, tracking low point");
                set_low_point(state, now, gallons);
            } else {
                *state = StagnationState::default();
            }
            return None;
        }
    };

    // The low point keeps the latest time the tank sat at its minimum.
    if gallons <= low {
        set_low_point(state, now, gallons);
        return None;
    }

    if state.recovery_alerted_for_low_point {
        return None;
    }

    let rebound = gallons - low;
    let stagnant_for = now - low_at;
    if rebound >= config.recovery_threshold_gallons && stagnant_for >= hours(config.stagnation_hours) {
        state.recovery_alerted_for_low_point = true;
        return Some(Event::new(
            EventKind::WellRecovered {
                low_point_at: low_at,
                low_point_gallons: low,
                gallons,
            },
            Severity::Info,
            format!(
                "Well recovered: tank up {:.0} gal from a low of {:.0} gal; stagnation ended at {}",
                rebound,
                low,
                low_at.format("%Y-%m-%d %H:%M UTC")
            ),
            now,
        ));
    }

    None
}

fn set_low_point(state: &mut StagnationState, at: DateTime<Utc>, gallons: f64) {
    state.low_point_timestamp = Some(at);
    state.low_point_gallons = Some(gallons);
    state.recovery_alerted_for_low_point = false;
}

/// Whether the history covers the last `stagnation_hours` and the level
/// never sat meaningfully below `gallons` during it.
fn flat_or_declining(
    gallons: f64,
    now: DateTime<Utc>,
    history: &ReadingHistory,
    stagnation_hours: f64,
) -> bool {
    let cutoff = now - hours(stagnation_hours);
    let Some(oldest) = history.as_slice().first() else {
        return false;
    };
    if oldest.timestamp > cutoff {
        return false;
    }
    history
        .since(cutoff)
        .iter()
        .all(|r| r.gallons >= gallons - SENSOR_ACCURACY_GALLONS)
}
