//! The running service: collaborators plus engine state.
//!
//! `run_tick` is the whole per-tick pipeline. It is blocking and is
//! called from the runtime's blocking pool, one tick at a time.

use crate::analysis::gph::{FillRates, GphCache};
use crate::analysis::window::Reading;
use crate::config::{ConfigLoader, GphConfig};
use crate::db::SnapshotArchive;
use crate::engine::{self, TickReport};
use crate::ingest::SnapshotSource;
use crate::logging::{self, Component};
use crate::model::MonitorError;
use crate::notify::{self, EventDispatcher};
use crate::relay::RelayActuator;
use crate::state::{PersistentState, StateStore};
use chrono::{DateTime, Utc};

pub struct Monitor {
    config: ConfigLoader,
    store: StateStore,
    state: PersistentState,
    source: Box<dyn SnapshotSource>,
    archive: Box<dyn SnapshotArchive>,
    dispatchers: Vec<Box<dyn EventDispatcher>>,
    actuator: Box<dyn RelayActuator>,
    gph: GphCache,
    gph_config: GphConfig,
}

impl Monitor {
    /// Builds the monitor and loads persisted state from `store`.
    pub fn new(
        config: ConfigLoader,
        store: StateStore,
        source: Box<dyn SnapshotSource>,
        archive: Box<dyn SnapshotArchive>,
        dispatchers: Vec<Box<dyn EventDispatcher>>,
        actuator: Box<dyn RelayActuator>,
    ) -> Self {
        let state = store.load();
        let gph_config = config.current().gph.clone();
        Self {
            config,
            store,
            state,
            source,
            archive,
            dispatchers,
            actuator,
            gph: GphCache::new(),
            gph_config,
        }
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn fill_rates(&self) -> Option<&FillRates> {
        self.gph.cached()
    }

    pub fn run_tick(&mut self) -> Result<TickReport, MonitorError> {
        self.run_tick_at(Utc::now())
    }

    /// One tick at `now`.
    ///
    /// State is saved before any event is dispatched. A failed save is
    /// returned as an error, but the tick's events are still dispatched and
    /// the in-memory state still advances, so the failure gate keeps
    /// counting during a disk problem.
    pub fn run_tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport, MonitorError> {
        let config = self.config.reload().clone();

        let snapshot = match self.source.fetch() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                logging::log_source_failure("fetch_snapshot", &e);
                None
            }
        };

        if let Some(snap) = &snapshot {
            if let Err(e) = self.archive.record(snap) {
                tracing::warn!(component = %Component::Archive, error = %e, "failed to archive snapshot");
            }
        }

        let report = engine::tick(snapshot.as_ref(), now, &config, &mut self.state, self.actuator.as_mut());

        let saved = self.store.save(&self.state);
        if let Err(e) = &saved {
            tracing::error!(
                component = %Component::State,
                path = %self.store.path().display(),
                error = %e,
                "state save failed"
            );
        }

        notify::dispatch_all(&mut self.dispatchers, &report.events);
        logging::log_tick_summary(
            report.gallons,
            report.events.len(),
            report.commands.len(),
            self.state.failures.consecutive_failures,
        );

        self.refresh_fill_rates(now, &config.gph);

        saved?;
        Ok(report)
    }

    /// Recomputes fill rates through the cache, logging when they change.
    fn refresh_fill_rates(&mut self, now: DateTime<Utc>, config: &GphConfig) {
        if *config != self.gph_config {
            self.gph.invalidate();
            self.gph_config = config.clone();
        }

        let previous = self.gph.cached().cloned();
        let archive = &mut self.archive;
        let result = self.gph.get_or_compute(now, config, |since| {
            archive.load_since(since).map(|snapshots| {
                snapshots
                    .iter()
                    .filter_map(|s| {
                        s.gallons().map(|gallons| Reading {
                            timestamp: s.timestamp,
                            gallons,
                            override_on: s.relay_override,
                        })
                    })
                    .collect()
            })
        });

        match result {
            Ok(rates) => {
                let changed = previous.as_ref().is_none_or(|p| {
                    p.override_on_gph != rates.override_on_gph || p.override_off_gph != rates.override_off_gph
                });
                if changed {
                    tracing::info!(
                        component = %Component::Archive,
                        override_on_gph = ?rates.override_on_gph,
                        override_off_gph = ?rates.override_off_gph,
                        on_windows = rates.on_windows,
                        off_windows = rates.off_windows,
                        "fill rates updated"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(component = %Component::Archive, error = %e, "fill rate history unavailable");
            }
        }
    }
}
