//! Sustained high fill rate.
//!
//! Advisory only: the result goes to a human and never drives a relay.

use crate::analysis::window::{Reading, ReadingHistory, hours, hours_between};
use crate::config::HighFlowConfig;
use crate::model::{Event, EventKind, Severity};
use crate::state::DedupMarker;
use chrono::{DateTime, Utc};

/// Net fill rate in gallons per hour, averaged over the last
/// `averaging_count` endpoints.
///
/// For each endpoint the rate is taken against the oldest sample no more
/// than `window_hours` earlier. Endpoints whose baseline is closer than half
/// a window are skipped; too short a span is dominated by sensor noise.
pub fn averaged_flow_rate(history: &ReadingHistory, current: Reading, config: &HighFlowConfig) -> Option<f64> {
    let mut samples: Vec<Reading> = history.as_slice().to_vec();
    if samples.last().is_none_or(|last| last.timestamp < current.timestamp) {
        samples.push(current);
    }

    let window = hours(config.window_hours);
    let min_span = config.window_hours / 2.0;
    let first_endpoint = samples.len().saturating_sub(config.averaging_count);

    let rates: Vec<f64> = samples[first_endpoint..]
        .iter()
        .filter_map(|end| {
            let cutoff = end.timestamp - window;
            let base = samples.iter().find(|r| r.timestamp >= cutoff)?;
            let span = hours_between(base.timestamp, end.timestamp);
            (span >= min_span).then(|| (end.gallons - base.gallons) / span)
        })
        .collect();

    if rates.is_empty() {
        None
    } else {
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    }
}

pub fn check_high_flow(
    current: Reading,
    history: &ReadingHistory,
    config: &HighFlowConfig,
    marker: &mut DedupMarker,
    now: DateTime<Utc>,
) -> Option<Event> {
    if !config.enabled {
        return None;
    }

    let rate = averaged_flow_rate(history, current, config)?;

    if rate <= config.high_flow_gph {
        if !marker.is_armed() {
            tracing::debug!(rate, "fill rate back under high-flow threshold");
            marker.rearm();
        }
        return None;
    }

    if !marker.is_armed() {
        return None;
    }

    marker.fire(now, rate);
    Some(Event::new(
        EventKind::HighFlow {
            gallons_per_hour: rate,
            threshold_gph: config.high_flow_gph,
        },
        Severity::Warning,
        format!(
            "High flow: tank filling at {:.0} GPH over the last {:.1} h (limit {:.0} GPH)",
            rate, config.window_hours, config.high_flow_gph
        ),
        now,
    ))
}
