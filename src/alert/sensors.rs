//! Pressure switch and float state changes.
//!
//! The first observation after a fresh start is only recorded; after that
//! every change is reported once.

use crate::config::SensorConfig;
use crate::model::{Event, EventKind, FloatState, Severity, Snapshot};
use crate::state::SensorState;

pub fn check_sensor_changes(snapshot: &Snapshot, config: &SensorConfig, state: &mut SensorState) -> Vec<Event> {
    let mut events = Vec::new();
    let now = snapshot.timestamp;

    if let Some(prev) = state.last_pressure_high {
        if prev != snapshot.pressure_high && config.notify_pressure_changes {
            let (severity, message) = if snapshot.pressure_high {
                (Severity::Info, "Supply pressure restored".to_string())
            } else {
                (Severity::Warning, "Supply pressure lost".to_string())
            };
            events.push(Event::new(
                EventKind::PressureChanged {
                    pressure_high: snapshot.pressure_high,
                },
                severity,
                message,
                now,
            ));
        }
    }
    state.last_pressure_high = Some(snapshot.pressure_high);

    if let Some(prev) = state.last_float_state {
        if prev != snapshot.float_state && config.notify_float_changes {
            let message = match snapshot.float_state {
                FloatState::Full => "Float switch reports tank full",
                FloatState::Calling => "Float switch calling for water",
            };
            events.push(Event::new(
                EventKind::FloatChanged {
                    float_state: snapshot.float_state,
                },
                Severity::Info,
                message,
                now,
            ));
        }
    }
    state.last_float_state = Some(snapshot.float_state);

    events
}
