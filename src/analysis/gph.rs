//! Fill rate (gallons per hour) statistics.
//!
//! History is cut into fixed, epoch-aligned windows. A window counts only if
//! the tank actually filled by more than the noise floor and the window is
//! well sampled; occupant usage and sensor glitches still slip through, so
//! each relay class reports the median rate rather than the mean.

use crate::analysis::window::{Reading, hours, hours_between, median, partition_windows};
use crate::config::GphConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillRates {
    /// Median fast-fill rate, with the override valve open.
    pub override_on_gph: Option<f64>,
    /// Median slow-fill rate through the well alone.
    pub override_off_gph: Option<f64>,
    pub on_windows: usize,
    pub off_windows: usize,
    pub computed_at: DateTime<Utc>,
}

/// Rate for one window, or `None` if the window doesn't qualify.
fn window_rate(window: &[Reading], config: &GphConfig) -> Option<f64> {
    if window.len() < config.min_samples.max(2) {
        return None;
    }
    let (first, last) = (window.first()?, window.last()?);

    let span = hours_between(first.timestamp, last.timestamp);
    if span <= 0.0 || span / config.window_hours < config.min_coverage {
        return None;
    }

    let delta = last.gallons - first.gallons;
    if delta < config.effective_min_delta() {
        return None;
    }
    Some(delta / span)
}

/// Computes fill rates from time-ordered readings.
///
/// Readings older than `lookback_days` before `now` are ignored. Each
/// window is classified by the override position of its first reading.
pub fn compute_fill_rates(readings: &[Reading], config: &GphConfig, now: DateTime<Utc>) -> FillRates {
    let cutoff = now - Duration::days(config.lookback_days);
    let start = readings.partition_point(|r| r.timestamp < cutoff);

    let mut on_rates = Vec::new();
    let mut off_rates = Vec::new();
    for (_, window) in partition_windows(&readings[start..], hours(config.window_hours)) {
        let Some(rate) = window_rate(window, config) else {
            continue;
        };
        if window[0].override_on {
            on_rates.push(rate);
        } else {
            off_rates.push(rate);
        }
    }

    FillRates {
        on_windows: on_rates.len(),
        off_windows: off_rates.len(),
        override_on_gph: median(&mut on_rates),
        override_off_gph: median(&mut off_rates),
        computed_at: now,
    }
}

/// TTL cache in front of `compute_fill_rates`.
#[derive(Debug, Default)]
pub struct GphCache {
    cached: Option<FillRates>,
}

impl GphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns cached rates if younger than the TTL, otherwise loads history
    /// with `load(since)` and recomputes.
    ///
    /// A load error leaves the previous value in place.
    pub fn get_or_compute<E>(
        &mut self,
        now: DateTime<Utc>,
        config: &GphConfig,
        load: impl FnOnce(DateTime<Utc>) -> Result<Vec<Reading>, E>,
    ) -> Result<&FillRates, E> {
        let ttl = Duration::minutes(config.cache_ttl_minutes);
        let fresh = self
            .cached
            .as_ref()
            .is_some_and(|c| now >= c.computed_at && now - c.computed_at < ttl);

        let rates = match self.cached.take() {
            Some(cached) if fresh => cached,
            previous => match load(now - Duration::days(config.lookback_days)) {
                Ok(readings) => compute_fill_rates(&readings, config, now),
                Err(e) => {
                    self.cached = previous;
                    return Err(e);
                }
            },
        };
        let rates: &FillRates = self.cached.insert(rates);
        Ok(rates)
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn cached(&self) -> Option<&FillRates> {
        self.cached.as_ref()
    }
}
