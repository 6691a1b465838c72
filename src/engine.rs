//! Per-tick orchestration.
//!
//! One call to `tick` takes a snapshot through every detector and the
//! override controller and mutates `PersistentState` in place. It does no
//! I/O apart from the relay actuator; the caller owns fetching, saving and
//! dispatch, and decides whether to keep the mutated state.

use crate::alert::{backflush, high_flow, recovery, sensors, stalenesses, thresholds};
use crate::analysis::window::Reading;
use crate::config::MonitorConfig;
use crate::control::{self, IssuedCommand};
use crate::model::{Event, Snapshot};
use crate::relay::RelayActuator;
use crate::state::PersistentState;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub timestamp: DateTime<Utc>,
    /// The tank level the detectors saw, after failure and staleness checks.
    pub gallons: Option<f64>,
    pub events: Vec<Event>,
    pub commands: Vec<IssuedCommand>,
}

/// Runs one tick.
///
/// `snapshot` is `None` when the source could not be reached at all. Relay
/// positions then come from state and the tick counts as a failed read.
pub fn tick(
    snapshot: Option<&Snapshot>,
    now: DateTime<Utc>,
    config: &MonitorConfig,
    state: &mut PersistentState,
    actuator: &mut dyn RelayActuator,
) -> TickReport {
    let mut events = Vec::new();

    // The relay board is the truth; a person may have flipped a relay by hand.
    if let Some(snap) = snapshot {
        let observed = snap.relays();
        if observed != state.relays {
            tracing::info!(
                override_on = observed.override_on,
                bypass = observed.bypass,
                "relay state changed outside the controller"
            );
            state.relays = observed;
        }
        events.extend(sensors::check_sensor_changes(snap, &config.sensors, &mut state.sensors));
    }
    let sampled_relays = state.relays;

    let gallons =
        snapshot.and_then(|snap| stalenesses::fresh_gallons(snap, config.sensors.max_reading_age_minutes, now));

    events.extend(thresholds::check_crossings(
        state.last_gallons,
        gallons,
        &config.thresholds,
        &mut state.thresholds,
        now,
    ));

    if let Some(g) = gallons {
        let history = &state.recent_readings;
        events.extend(recovery::check_recovery(g, now, history, &config.stagnation, &mut state.stagnation));
        events.extend(backflush::check_backflush(g, now, history, &config.backflush, &mut state.backflush));

        let current = Reading {
            timestamp: now,
            gallons: g,
            override_on: sampled_relays.override_on,
        };
        events.extend(high_flow::check_high_flow(
            current,
            history,
            &config.high_flow,
            &mut state.high_flow,
            now,
        ));
    }

    let outcome = control::run_override_control(
        gallons,
        &config.override_control,
        &mut state.relays,
        &mut state.failures,
        actuator,
        now,
    );
    events.extend(outcome.events);

    if let Some(g) = gallons {
        state.last_gallons = Some(g);
        state.recent_readings.record(
            Reading {
                timestamp: now,
                gallons: g,
                override_on: sampled_relays.override_on,
            },
            Duration::minutes(config.poll.history_sample_minutes),
            Duration::hours(config.poll.history_retain_hours),
        );
    }

    TickReport {
        timestamp: now,
        gallons,
        events,
        commands: outcome.commands,
    }
}
