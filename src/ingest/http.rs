/// Sensor bridge HTTP client
///
/// The bridge runs next to the tank. It scrapes the tank level sensor, reads
/// the pressure and float switches and the relay board, and serves the lot
/// as one JSON document. A failed tank scrape is reported in-band
/// (`tank.error`) while the switches and relays are still returned.

use crate::model::{FloatState, Snapshot, SourceError};
use crate::ingest::SnapshotSource;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

// ============================================================================
// Bridge Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct BridgeResponse {
    pub tank: BridgeTank,
    pub pressure_high: bool,
    #[serde(rename = "float")]
    pub float_state: FloatState,
    pub relays: BridgeRelays,
}

#[derive(Debug, Deserialize)]
pub struct BridgeTank {
    pub gallons: Option<f64>,
    /// When the sensor took the reading, e.g. "2024-05-01T13:00:00Z" or
    /// "2024-05-01 13:00:00" (UTC).
    pub last_updated: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BridgeRelays {
    #[serde(rename = "override")]
    pub override_on: bool,
    pub bypass: bool,
}

// ============================================================================
// Parsing
// ============================================================================

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}

/// Build a snapshot for tick time `now` from a bridge response body.
pub fn parse_bridge_response(body: &str, now: DateTime<Utc>) -> Result<Snapshot, SourceError> {
    let response: BridgeResponse =
        serde_json::from_str(body).map_err(|e| SourceError::Parse(e.to_string()))?;

    let tank_reading_at = match response.tank.last_updated.as_deref() {
        Some(text) => Some(
            parse_timestamp(text)
                .ok_or_else(|| SourceError::Parse(format!("bad tank timestamp '{}'", text)))?,
        ),
        None => None,
    };

    let tank_read_failed = response.tank.error.is_some() || response.tank.gallons.is_none();
    if let Some(err) = &response.tank.error {
        tracing::debug!(error = %err, "bridge reported tank scrape failure");
    }

    Ok(Snapshot {
        timestamp: now,
        tank_gallons: if tank_read_failed { None } else { response.tank.gallons },
        tank_reading_at,
        pressure_high: response.pressure_high,
        float_state: response.float_state,
        relay_override: response.relays.override_on,
        relay_bypass: response.relays.bypass,
        tank_read_failed,
    })
}

// ============================================================================
// Client
// ============================================================================

pub struct HttpSnapshotSource {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl SnapshotSource for HttpSnapshotSource {
    fn fetch(&mut self) -> Result<Snapshot, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()?;

        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }

        let body = response.text()?;
        parse_bridge_response(&body, Utc::now())
    }
}
