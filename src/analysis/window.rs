//! Windowing primitives shared by the detectors and the GPH calculator.
//!
//! `ReadingHistory` is the bounded rolling sample buffer the windowed
//! detectors read from. It is persisted with the rest of the engine state
//! so a restart sees the same window it left behind.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A successful tank reading, tagged with the override relay position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub gallons: f64,
    #[serde(default)]
    pub override_on: bool,
}

/// Time-ordered samples, thinned to at most one per sample interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingHistory {
    readings: Vec<Reading>,
}

impl ReadingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `reading` if at least `sample_every` has passed since the last
    /// kept sample, then drops samples older than `retain`.
    ///
    /// Out-of-order readings are ignored. Returns whether the reading was kept.
    pub fn record(&mut self, reading: Reading, sample_every: Duration, retain: Duration) -> bool {
        let keep = match self.readings.last() {
            Some(last) => reading.timestamp - last.timestamp >= sample_every,
            None => true,
        };
        if keep {
            self.readings.push(reading);
        }
        self.evict(reading.timestamp - retain);
        keep
    }

    pub fn evict(&mut self, cutoff: DateTime<Utc>) {
        let stale = self
            .readings
            .iter()
            .take_while(|r| r.timestamp < cutoff)
            .count();
        if stale > 0 {
            self.readings.drain(..stale);
        }
    }

    /// The last `n` samples, oldest first.
    pub fn last_n(&self, n: usize) -> &[Reading] {
        let start = self.readings.len().saturating_sub(n);
        &self.readings[start..]
    }

    /// Samples at or after `cutoff`, oldest first.
    pub fn since(&self, cutoff: DateTime<Utc>) -> &[Reading] {
        let start = self.readings.partition_point(|r| r.timestamp < cutoff);
        &self.readings[start..]
    }

    pub fn as_slice(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Splits time-ordered readings into non-overlapping, epoch-aligned windows.
///
/// Empty windows are omitted. Each returned slice is non-empty and contains
/// only readings whose timestamp falls in `[start, start + width)`.
pub fn partition_windows(readings: &[Reading], width: Duration) -> Vec<(DateTime<Utc>, &[Reading])> {
    let width_secs = width.num_seconds();
    if width_secs <= 0 {
        return Vec::new();
    }

    let bucket_of = |r: &Reading| r.timestamp.timestamp().div_euclid(width_secs);

    let mut windows = Vec::new();
    let mut start = 0;
    while start < readings.len() {
        let bucket = bucket_of(&readings[start]);
        let len = readings[start..]
            .iter()
            .take_while(|r| bucket_of(r) == bucket)
            .count();
        let window_start = DateTime::from_timestamp(bucket * width_secs, 0).unwrap_or(readings[start].timestamp);
        windows.push((window_start, &readings[start..start + len]));
        start += len;
    }
    windows
}

/// Median of `values`; the mean of the middle pair for an even count.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Fractional hours between two instants.
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Converts fractional hours into a `Duration`, truncated to the second.
pub fn hours(h: f64) -> Duration {
    Duration::seconds((h * 3600.0) as i64)
}
