/// Snapshot archive.
///
/// Every tick's snapshot is recorded so the fill-rate calculator has
/// history beyond the 24 h window the detectors keep in the state file,
/// and so development runs can replay a real week of sensor data.
///
/// `PgArchive` writes to the `tank_snapshots` table; `MemoryArchive`
/// is used when no `DATABASE_URL` is configured.

use crate::model::{FloatState, Snapshot};
use chrono::{DateTime, Duration, Utc};
use postgres::{Client, NoTls, Row};
use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("DATABASE_URL is not set")]
    MissingUrl,
    #[error("database error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("unrecognised float state '{0}' in archive")]
    BadFloatState(String),
}

pub trait SnapshotArchive: Send {
    fn record(&mut self, snapshot: &Snapshot) -> Result<(), ArchiveError>;

    /// Snapshots with `timestamp >= since`, oldest first.
    fn load_since(&mut self, since: DateTime<Utc>) -> Result<Vec<Snapshot>, ArchiveError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS tank_snapshots (
        observed_at      TIMESTAMPTZ PRIMARY KEY,
        tank_gallons     DOUBLE PRECISION,
        tank_reading_at  TIMESTAMPTZ,
        pressure_high    BOOLEAN NOT NULL,
        float_state      TEXT NOT NULL,
        relay_override   BOOLEAN NOT NULL,
        relay_bypass     BOOLEAN NOT NULL,
        tank_read_failed BOOLEAN NOT NULL DEFAULT FALSE
    )
";

const SNAPSHOT_COLUMNS: &str = "observed_at, tank_gallons, tank_reading_at, pressure_high, \
     float_state, relay_override, relay_bypass, tank_read_failed";

/// Connect using `DATABASE_URL` from the environment (or `.env`).
pub fn connect_from_env() -> Result<Client, ArchiveError> {
    dotenv::dotenv().ok();
    let url = env::var("DATABASE_URL").map_err(|_| ArchiveError::MissingUrl)?;
    Ok(Client::connect(&url, NoTls)?)
}

pub(crate) fn float_state_from_db(text: &str) -> Result<FloatState, ArchiveError> {
    match text {
        "FULL" => Ok(FloatState::Full),
        "CALLING" => Ok(FloatState::Calling),
        other => Err(ArchiveError::BadFloatState(other.to_string())),
    }
}

/// Map a row selected with `SNAPSHOT_COLUMNS`.
pub(crate) fn snapshot_from_row(row: &Row) -> Result<Snapshot, ArchiveError> {
    let float_text: String = row.get(4);
    Ok(Snapshot {
        timestamp: row.get(0),
        tank_gallons: row.get(1),
        tank_reading_at: row.get(2),
        pressure_high: row.get(3),
        float_state: float_state_from_db(&float_text)?,
        relay_override: row.get(5),
        relay_bypass: row.get(6),
        tank_read_failed: row.get(7),
    })
}

pub struct PgArchive {
    client: Client,
}

impl PgArchive {
    /// Wrap a connected client, creating the table if needed.
    pub fn new(mut client: Client) -> Result<Self, ArchiveError> {
        client.batch_execute(CREATE_TABLE)?;
        Ok(Self { client })
    }

    pub fn connect_from_env() -> Result<Self, ArchiveError> {
        Self::new(connect_from_env()?)
    }

    /// Oldest and newest archived snapshot times.
    pub fn data_range(&mut self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, ArchiveError> {
        let row = self
            .client
            .query_one("SELECT MIN(observed_at), MAX(observed_at) FROM tank_snapshots", &[])?;

        let min: Option<DateTime<Utc>> = row.get(0);
        let max: Option<DateTime<Utc>> = row.get(1);

        match (min, max) {
            (Some(start), Some(end)) => Ok(Some((start, end))),
            _ => Ok(None),
        }
    }

    pub fn into_client(self) -> Client {
        self.client
    }
}

impl SnapshotArchive for PgArchive {
    fn record(&mut self, snapshot: &Snapshot) -> Result<(), ArchiveError> {
        let float_text = snapshot.float_state.to_string();
        self.client.execute(
            "INSERT INTO tank_snapshots
                (observed_at, tank_gallons, tank_reading_at, pressure_high,
                 float_state, relay_override, relay_bypass, tank_read_failed)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (observed_at) DO NOTHING",
            &[
                &snapshot.timestamp,
                &snapshot.tank_gallons,
                &snapshot.tank_reading_at,
                &snapshot.pressure_high,
                &float_text,
                &snapshot.relay_override,
                &snapshot.relay_bypass,
                &snapshot.tank_read_failed,
            ],
        )?;
        Ok(())
    }

    fn load_since(&mut self, since: DateTime<Utc>) -> Result<Vec<Snapshot>, ArchiveError> {
        let query = format!(
            "SELECT {} FROM tank_snapshots WHERE observed_at >= $1 ORDER BY observed_at",
            SNAPSHOT_COLUMNS
        );
        let rows = self.client.query(query.as_str(), &[&since])?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Bounded in-process archive. Loses history on restart, which only
/// delays the first fill-rate figures.
#[derive(Debug, Clone)]
pub struct MemoryArchive {
    snapshots: Vec<Snapshot>,
    retain: Duration,
}

impl MemoryArchive {
    pub fn new(retain: Duration) -> Self {
        Self {
            snapshots: Vec::new(),
            retain,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotArchive for MemoryArchive {
    fn record(&mut self, snapshot: &Snapshot) -> Result<(), ArchiveError> {
        if self
            .snapshots
            .last()
            .is_some_and(|last| last.timestamp >= snapshot.timestamp)
        {
            return Ok(());
        }
        self.snapshots.push(snapshot.clone());

        let cutoff = snapshot.timestamp - self.retain;
        let stale = self.snapshots.partition_point(|s| s.timestamp < cutoff);
        self.snapshots.drain(..stale);
        Ok(())
    }

    fn load_since(&mut self, since: DateTime<Utc>) -> Result<Vec<Snapshot>, ArchiveError> {
        let start = self.snapshots.partition_point(|s| s.timestamp < since);
        Ok(self.snapshots[start..].to_vec())
    }
}
