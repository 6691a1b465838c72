/// Development mode utilities for working with historical data
///
/// When the sensor bridge is unavailable, use this module to replay
/// archived snapshots as if they were live, shifted forward by a fixed
/// number of days.

use crate::db::{self, ArchiveError};
use crate::ingest::SnapshotSource;
use crate::model::{Snapshot, SourceError};
use chrono::{DateTime, Duration, Utc};
use postgres::Client;

/// Configuration for development mode data replay
pub struct DevMode {
    /// Simulate data as if it's this many days in the past
    pub days_offset: i64,
    /// How far back from the simulated time to look for a snapshot
    pub lookback_secs: i64,
}

impl DevMode {
    /// Create a new dev mode configuration
    ///
    /// # Arguments
    /// * `days_offset` - Replay data from this many days ago
    pub fn new(days_offset: i64) -> Self {
        Self {
            days_offset,
            lookback_secs: 120,
        }
    }

    /// The wall-clock instant being replayed for real time `now`.
    pub fn simulated_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.days_offset)
    }

    /// Shift an archived snapshot forward so it reads as current.
    pub fn shift_to_present(&self, mut snapshot: Snapshot) -> Snapshot {
        let offset = Duration::days(self.days_offset);
        snapshot.timestamp += offset;
        snapshot.tank_reading_at = snapshot.tank_reading_at.map(|t| t + offset);
        snapshot
    }

    /// Fetch the archived snapshot closest before the simulated time.
    pub fn fetch_simulated_snapshot(
        &self,
        client: &mut Client,
        now: DateTime<Utc>,
    ) -> Result<Option<Snapshot>, ArchiveError> {
        let simulated_now = self.simulated_time(now);
        let window_start = simulated_now - Duration::seconds(self.lookback_secs);

        let rows = client.query(
            "SELECT observed_at, tank_gallons, tank_reading_at, pressure_high,
                    float_state, relay_override, relay_bypass, tank_read_failed
             FROM tank_snapshots
             WHERE observed_at >= $1
               AND observed_at <= $2
             ORDER BY observed_at DESC
             LIMIT 1",
            &[&window_start, &simulated_now],
        )?;

        match rows.first() {
            Some(row) => Ok(Some(self.shift_to_present(db::snapshot_from_row(row)?))),
            None => Ok(None),
        }
    }
}

/// `SnapshotSource` that replays the archive through `DevMode`.
pub struct ReplaySource {
    dev: DevMode,
    client: Client,
}

impl ReplaySource {
    pub fn new(dev: DevMode, client: Client) -> Self {
        Self { dev, client }
    }
}

impl SnapshotSource for ReplaySource {
    fn fetch(&mut self) -> Result<Snapshot, SourceError> {
        let now = Utc::now();
        match self.dev.fetch_simulated_snapshot(&mut self.client, now) {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(SourceError::NoData(format!(
                "no archived snapshot near {}",
                self.dev.simulated_time(now).format("%Y-%m-%d %H:%M UTC")
            ))),
            Err(e) => Err(SourceError::Archive(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FloatState;
    use chrono::TimeZone;

    #[test]
    fn test_dev_mode_creation() {
        let dev = DevMode::new(365);
        assert_eq!(dev.days_offset, 365);
        assert_eq!(dev.lookback_secs, 120);
    }

    #[test]
    fn test_shift_to_present_moves_both_timestamps() {
        let dev = DevMode::new(7);
        let then = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let snap = Snapshot {
            timestamp: then,
            tank_gallons: Some(1000.0),
            tank_reading_at: Some(then - Duration::minutes(1)),
            pressure_high: true,
            float_state: FloatState::Full,
            relay_override: false,
            relay_bypass: false,
            tank_read_failed: false,
        };
        let shifted = dev.shift_to_present(snap);
        assert_eq!(shifted.timestamp, then + Duration::days(7));
        assert_eq!(shifted.tank_reading_at, Some(then + Duration::days(7) - Duration::minutes(1)));
        assert_eq!(dev.simulated_time(shifted.timestamp), then);
    }
}
