/// Tank reading staleness detection.
///
/// The tank level arrives by scraping a vendor page that keeps showing the
/// last value it has when the tank sensor stops reporting. A frozen value
/// looks like a healthy flat tank, which would silently hold off every
/// level-based rule. This module flags readings that are too old so the
/// engine can treat them like a failed read.
///
/// # Clock injection
/// All functions accept a `now: DateTime<Utc>` parameter rather than calling
/// `Utc::now()` internally. This makes staleness purely deterministic in
/// tests without mocking or time manipulation.

use crate::model::Snapshot;
use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Staleness check
// ---------------------------------------------------------------------------

/// Returns `true` if `reading_at` is older than `max_age_minutes` relative
/// to `now`.
///
/// Staleness is defined as strictly greater than the threshold:
///   age > max_age_minutes  →  stale
///   age == max_age_minutes →  not stale
///
/// A reading stamped in the future (clock skew) is not stale.
pub fn is_stale_at(reading_at: DateTime<Utc>, max_age_minutes: u64, now: DateTime<Utc>) -> bool {
    let age_minutes = (now - reading_at).num_minutes();
    age_minutes > 0 && age_minutes as u64 > max_age_minutes
}

/// The snapshot's tank level, or `None` if it failed or is stale.
///
/// Snapshots that do not report when the sensor took the reading are
/// trusted as fresh.
pub fn fresh_gallons(snapshot: &Snapshot, max_age_minutes: u64, now: DateTime<Utc>) -> Option<f64> {
    let gallons = snapshot.gallons()?;
    match snapshot.tank_reading_at {
        Some(at) if is_stale_at(at, max_age_minutes, now) => {
            tracing::warn!(
                reading_at = %at,
                max_age_minutes,
                "tank reading is stale, treating as failed read"
            );
            None
        }
        _ => Some(gallons),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
