//! Tank level threshold crossing.
//!
//! A decreasing threshold fires when the level falls from above it to at or
//! below it; an increasing threshold fires when the level rises from below
//! it to at or above it. Once fired, a threshold stays silent until the
//! level moves back past it by more than the configured dead-band, so a
//! reading that bounces around the line alerts once.
//!
//! Landing exactly on a threshold counts as crossing it. The threshold sits
//! strictly between the two readings or is equal to the new one, never to
//! the previous one: a tank parked at 1000 gal fires the 1000 gal
//! threshold on arrival and stays quiet while it sits there.

use crate::config::ThresholdConfig;
use crate::model::{Direction, Event, EventKind, Severity};
use crate::state::DedupMarker;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Key of a threshold's marker in the persisted state.
pub fn threshold_key(direction: Direction, value: f64) -> String {
    format!("{}:{}", direction, value)
}

/// Checks the move from `previous` to `current` against every configured
/// threshold and returns one event per newly crossed threshold.
///
/// A missing reading on either side is a no-op: markers are not touched.
/// When one tick jumps across several thresholds, all of them fire in the
/// order the level passed through them.
pub fn check_crossings(
    previous: Option<f64>,
    current: Option<f64>,
    config: &ThresholdConfig,
    markers: &mut BTreeMap<String, DedupMarker>,
    now: DateTime<Utc>,
) -> Vec<Event> {
    let (Some(prev), Some(cur)) = (previous, current) else {
        return Vec::new();
    };

    prune_unconfigured(config, markers);
    rearm(cur, config, markers);

    let mut events = Vec::new();

    if cur < prev {
        // Highest threshold is passed first on the way down.
        for &t in config.decreasing.iter().rev() {
            if prev > t && cur <= t {
                let marker = markers.entry(threshold_key(Direction::Decreasing, t)).or_default();
                if marker.is_armed() {
                    marker.fire(now, t);
                    events.push(crossing_event(Direction::Decreasing, t, cur, now));
                } else {
                    tracing::debug!(threshold = t, "decreasing threshold already alerted");
                }
            }
        }
    } else if cur > prev {
        for &t in config.increasing.iter() {
            if prev < t && cur >= t {
                let marker = markers.entry(threshold_key(Direction::Increasing, t)).or_default();
                if marker.is_armed() {
                    marker.fire(now, t);
                    events.push(crossing_event(Direction::Increasing, t, cur, now));
                } else {
                    tracing::debug!(threshold = t, "increasing threshold already alerted");
                }
            }
        }
    }

    events
}

/// Re-arms every fired threshold the level has moved back past.
fn rearm(cur: f64, config: &ThresholdConfig, markers: &mut BTreeMap<String, DedupMarker>) {
    let band = config.dead_band_gallons;

    for &t in &config.decreasing {
        if let Some(marker) = markers.get_mut(&threshold_key(Direction::Decreasing, t)) {
            if !marker.is_armed() && cur > t + band {
                marker.rearm();
            }
        }
    }
    for &t in &config.increasing {
        if let Some(marker) = markers.get_mut(&threshold_key(Direction::Increasing, t)) {
            if !marker.is_armed() && cur < t - band {
                marker.rearm();
            }
        }
    }
}

/// Drops markers for thresholds that are no longer configured.
fn prune_unconfigured(config: &ThresholdConfig, markers: &mut BTreeMap<String, DedupMarker>) {
    markers.retain(|key, _| {
        config
            .decreasing
            .iter()
            .any(|&t| *key == threshold_key(Direction::Decreasing, t))
            || config
                .increasing
                .iter()
                .any(|&t| *key == threshold_key(Direction::Increasing, t))
    });
}

fn crossing_event(direction: Direction, threshold: f64, gallons: f64, now: DateTime<Utc>) -> Event {
    let (severity, message) = match direction {
        Direction::Decreasing => (
            Severity::Warning,
            format!(
                "Tank level fell below {:.0} gal (now {:.0} gal)",
                threshold, gallons
            ),
        ),
        Direction::Increasing => (
            Severity::Info,
            format!(
                "Tank level rose above {:.0} gal (now {:.0} gal)",
                threshold, gallons
            ),
        ),
    };
    Event::new(
        EventKind::ThresholdCrossed {
            direction,
            threshold,
            gallons,
        },
        severity,
        message,
        now,
    )
}
