//! Overnight backflush detection.
//!
//! The softener/filter backflush dumps a large volume in a few minutes,
//! usually in the small hours. Inside the configured overnight window the
//! current level is compared to the last `window_snapshots` history samples;
//! a drop of `threshold_gallons` or more from the highest of them is a
//! backflush.
//!
//! The rule runs on every tick. Duplicates are suppressed by the time the
//! drop began rather than by a cooldown, so a second backflush shortly after
//! the first is still reported.

use crate::analysis::window::{Reading, ReadingHistory};
use crate::config::BackflushConfig;
use crate::model::{Event, EventKind, Severity};
use crate::state::BackflushState;
use chrono::{DateTime, Duration, Timelike, Utc};

/// A drop that starts within this long of the last event, from a level no
/// higher than where that event left the tank, is the same backflush still
/// draining.
const SAME_EPISODE_SPAN_HOURS: i64 = 12;

/// Whether `now` falls inside the overnight window, in local time.
pub fn in_overnight_window(now: DateTime<Utc>, config: &BackflushConfig) -> bool {
    let local_hour = (now + Duration::hours(config.utc_offset_hours as i64)).hour();
    let (start, end) = (config.window_start_hour, config.window_end_hour);
    if start == end {
        false
    } else if start < end {
        start <= local_hour && local_hour < end
    } else {
        local_hour >= start || local_hour < end
    }
}

pub fn check_backflush(
    gallons: f64,
    now: DateTime<Utc>,
    history: &ReadingHistory,
    config: &BackflushConfig,
    state: &mut BackflushState,
) -> Option<Event> {
    if !config.enabled || !in_overnight_window(now, config) {
        return None;
    }

    // Latest sample holding the window's peak: the drop began after it.
    let peak = history
        .last_n(config.window_snapshots)
        .iter()
        .fold(None, |best: Option<&Reading>, r| match best {
            Some(b) if b.gallons > r.gallons => Some(b),
            _ => Some(r),
        })?;

    let drop = peak.gallons - gallons;
    if drop < config.threshold_gallons {
        return None;
    }

    if let Some(last_at) = state.last_event_at {
        if peak.timestamp <= last_at {
            return None;
        }
        let still_draining = state
            .last_event_gallons
            .is_some_and(|g| peak.gallons <= g)
            && peak.timestamp - last_at < Duration::hours(SAME_EPISODE_SPAN_HOURS);
        if still_draining {
            tracing::debug!(drop, started_at = %peak.timestamp, "backflush already reported");
            return None;
        }
    }

    state.last_event_at = Some(now);
    state.last_drop_started_at = Some(peak.timestamp);
    state.last_event_gallons = Some(gallons);

    Some(Event::new(
        EventKind::Backflush {
            drop_gallons: drop,
            started_at: peak.timestamp,
        },
        Severity::Info,
        format!(
            "Backflush detected: tank dropped {:.0} gal since {}",
            drop,
            peak.timestamp.format("%H:%M UTC")
        ),
        now,
    ))
}
