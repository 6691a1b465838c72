/// End-to-end scenarios through the public API
///
/// These tests drive the full tick pipeline (source → engine → state file)
/// with scripted snapshots and a dry-run relay actuator. No network or
/// database is needed; each test gets its own temporary state file.
///
/// Run with: cargo test --test scenarios

use chrono::{DateTime, Duration, TimeZone, Utc};
use tankmon_service::config::{ConfigLoader, MonitorConfig};
use tankmon_service::db::MemoryArchive;
use tankmon_service::engine;
use tankmon_service::ingest::ManualSource;
use tankmon_service::model::{Event, FloatState, RelayAction, Snapshot, SourceError};
use tankmon_service::monitor::Monitor;
use tankmon_service::notify::LogDispatcher;
use tankmon_service::relay::DryRunActuator;
use tankmon_service::state::{PersistentState, StateStore};
use std::path::Path;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn snapshot(at: DateTime<Utc>, gallons: f64, override_on: bool) -> Snapshot {
    Snapshot {
        timestamp: at,
        tank_gallons: Some(gallons),
        tank_reading_at: Some(at),
        pressure_high: true,
        float_state: FloatState::Calling,
        relay_override: override_on,
        relay_bypass: false,
        tank_read_failed: false,
    }
}

fn failed_read(at: DateTime<Utc>, override_on: bool) -> Snapshot {
    Snapshot {
        tank_gallons: None,
        tank_read_failed: true,
        ..snapshot(at, 0.0, override_on)
    }
}

fn override_config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.override_control.on_threshold = Some(1350.0);
    config.override_control.shutoff_threshold = 1410.0;
    config.override_control.max_consecutive_failures = 3;
    config
}

fn monitor(path: &Path, config: MonitorConfig, source: ManualSource) -> Monitor {
    let store = StateStore::open(path).expect("state store should open");
    Monitor::new(
        ConfigLoader::fixed(config),
        store,
        Box::new(source),
        Box::new(MemoryArchive::new(Duration::days(7))),
        vec![Box::new(LogDispatcher)],
        Box::new(DryRunActuator::new()),
    )
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

fn count(events: &[Event], kind: &str) -> usize {
    events.iter().filter(|e| e.kind.name() == kind).count()
}

/// One scripted level per minute starting at `start`.
fn minute_feed(start: DateTime<Utc>, levels: impl IntoIterator<Item = f64>) -> Vec<(DateTime<Utc>, f64)> {
    levels
        .into_iter()
        .enumerate()
        .map(|(i, g)| (start + Duration::minutes(i as i64), g))
        .collect()
}

/// Ticks `m` at each feed time and counts events of `kind`.
fn tally(m: &mut Monitor, feed: &[(DateTime<Utc>, f64)], kind: &str) -> usize {
    feed.iter()
        .map(|&(at, _)| count(&m.run_tick_at(at).unwrap().events, kind))
        .sum()
}

/// Runs one tick per feed entry and returns every event raised.
fn run_feed(path: &Path, config: &MonitorConfig, feed: &[(DateTime<Utc>, f64)]) -> Vec<Event> {
    let mut source = ManualSource::new();
    for &(at, g) in feed {
        source.push(snapshot(at, g, false));
    }
    let mut m = monitor(path, config.clone(), source);
    feed.iter()
        .flat_map(|&(at, _)| m.run_tick_at(at).unwrap().events)
        .collect()
}

// ---------------------------------------------------------------------------
// Threshold idempotency
// ---------------------------------------------------------------------------

#[test]
fn test_threshold_fires_once_while_level_stays_below() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ManualSource::new();
    source.push(snapshot(t0(), 1010.0, false));
    for i in 1..=10 {
        source.push(snapshot(t0() + Duration::minutes(i), 990.0 - i as f64, false));
    }

    let mut m = monitor(&dir.path().join("state.json"), MonitorConfig::default(), source);
    let mut crossings = 0;
    for i in 0..=10 {
        let report = m.run_tick_at(t0() + Duration::minutes(i)).unwrap();
        crossings += report
            .events
            .iter()
            .filter(|e| e.kind.name() == "threshold_crossed")
            .count();
    }
    assert_eq!(crossings, 1);
}

#[test]
fn test_restart_does_not_refire_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let mut source = ManualSource::new();
        source.push(snapshot(t0(), 1010.0, false));
        source.push(snapshot(t0() + Duration::minutes(1), 990.0, false));
        let mut m = monitor(&path, MonitorConfig::default(), source);
        m.run_tick_at(t0()).unwrap();
        let report = m.run_tick_at(t0() + Duration::minutes(1)).unwrap();
        assert_eq!(kinds(&report.events), vec!["threshold_crossed"]);
    }

    // Same snapshot again after a restart: nothing new to say.
    let mut source = ManualSource::new();
    source.push(snapshot(t0() + Duration::minutes(2), 990.0, false));
    let mut m = monitor(&path, MonitorConfig::default(), source);
    let report = m.run_tick_at(t0() + Duration::minutes(2)).unwrap();
    assert!(report.events.is_empty(), "got {:?}", kinds(&report.events));
    assert_eq!(m.state().last_gallons, Some(990.0));
}

#[test]
fn test_second_instance_on_same_state_file_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let _first = monitor(&path, MonitorConfig::default(), ManualSource::new());
    assert!(StateStore::open(&path).is_err());
}

// ---------------------------------------------------------------------------
// Failure gate
// ---------------------------------------------------------------------------

#[test]
fn test_two_failures_then_success_keeps_override_on() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ManualSource::new();
    source.push(snapshot(t0(), 1380.0, true));
    source.push_error(SourceError::Status(502));
    source.push_error(SourceError::Status(502));
    source.push(snapshot(t0() + Duration::minutes(3), 1385.0, true));

    let mut m = monitor(&dir.path().join("state.json"), override_config(), source);
    let mut all = Vec::new();
    for i in 0..4 {
        let report = m.run_tick_at(t0() + Duration::minutes(i)).unwrap();
        assert!(report.commands.is_empty());
        all.extend(report.events);
    }
    assert!(!kinds(&all).contains(&"safety_shutoff"));
    assert!(m.state().relays.override_on);
    assert_eq!(m.state().failures.consecutive_failures, 0);
}

#[test]
fn test_sustained_outage_shuts_off_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ManualSource::new();
    source.push(snapshot(t0(), 1380.0, true));
    for _ in 0..8 {
        source.push_error(SourceError::Status(504));
    }

    let mut m = monitor(&dir.path().join("state.json"), override_config(), source);
    let mut shutoffs = 0;
    let mut commands = Vec::new();
    for i in 0..9 {
        let report = m.run_tick_at(t0() + Duration::minutes(i)).unwrap();
        shutoffs += report
            .events
            .iter()
            .filter(|e| e.kind.name() == "safety_shutoff")
            .count();
        commands.extend(report.commands);
    }

    assert_eq!(shutoffs, 1);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command.action, RelayAction::Off);
    assert!(!m.state().relays.override_on);
}

#[test]
fn test_restart_mid_outage_still_trips_on_third_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let mut source = ManualSource::new();
        source.push(snapshot(t0(), 1380.0, true));
        source.push_error(SourceError::Status(504));
        source.push_error(SourceError::Status(504));
        let mut m = monitor(&path, override_config(), source);
        for i in 0..3 {
            let report = m.run_tick_at(t0() + Duration::minutes(i)).unwrap();
            assert!(report.commands.is_empty());
        }
        assert_eq!(m.state().failures.consecutive_failures, 2);
    }

    let mut source = ManualSource::new();
    for _ in 0..4 {
        source.push_error(SourceError::Status(504));
    }
    let mut m = monitor(&path, override_config(), source);
    let reports: Vec<_> = (3..7)
        .map(|i| m.run_tick_at(t0() + Duration::minutes(i)).unwrap())
        .collect();

    assert_eq!(count(&reports[0].events, "safety_shutoff"), 1);
    assert_eq!(reports[0].commands.len(), 1);
    assert_eq!(reports[0].commands[0].command.action, RelayAction::Off);
    for report in &reports[1..] {
        assert!(report.events.is_empty(), "got {:?}", kinds(&report.events));
        assert!(report.commands.is_empty());
    }
    assert!(m.state().failures.safety_triggered);
}

#[test]
fn test_override_reenabled_during_read_outage_is_shut_off_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ManualSource::new();
    source.push(snapshot(t0(), 1380.0, true));
    for i in 1..=3 {
        source.push(failed_read(t0() + Duration::minutes(i), true));
    }
    // Someone switched override back on by hand; the sensor is still down.
    source.push(failed_read(t0() + Duration::minutes(4), true));
    source.push(failed_read(t0() + Duration::minutes(5), false));

    let mut m = monitor(&dir.path().join("state.json"), override_config(), source);
    let mut actions = Vec::new();
    let mut shutoffs = 0;
    for i in 0..6 {
        let report = m.run_tick_at(t0() + Duration::minutes(i)).unwrap();
        shutoffs += count(&report.events, "safety_shutoff");
        actions.push(report.commands.iter().map(|c| c.command.action).collect::<Vec<_>>());
    }

    assert_eq!(
        actions,
        vec![
            vec![],
            vec![],
            vec![],
            vec![RelayAction::Off],
            vec![RelayAction::Off],
            vec![],
        ]
    );
    assert_eq!(shutoffs, 2);
    assert!(!m.state().relays.override_on);
}

// ---------------------------------------------------------------------------
// Override continuous enforcement
// ---------------------------------------------------------------------------

#[test]
fn test_override_is_enforced_against_manual_reenable() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ManualSource::new();
    source.push(snapshot(t0(), 1340.0, false));
    source.push(snapshot(t0() + Duration::minutes(1), 1415.0, true));
    // Someone turned override back on by hand.
    source.push(snapshot(t0() + Duration::minutes(2), 1415.0, true));

    let mut m = monitor(&dir.path().join("state.json"), override_config(), source);
    let actions: Vec<Vec<RelayAction>> = (0..3)
        .map(|i| {
            m.run_tick_at(t0() + Duration::minutes(i))
                .unwrap()
                .commands
                .iter()
                .map(|c| c.command.action)
                .collect()
        })
        .collect();

    assert_eq!(
        actions,
        vec![vec![RelayAction::On], vec![RelayAction::Off], vec![RelayAction::Off]]
    );
}

// ---------------------------------------------------------------------------
// Stagnation / recovery
// ---------------------------------------------------------------------------

/// Seven hours flat at 1100 (the low point settles at its last reading,
/// t0+7h), a small rise that is not yet a recovery, then 1160 more than
/// six hours after the low.
fn recovery_feed() -> Vec<(DateTime<Utc>, f64)> {
    let mut feed = Vec::new();
    let mut now = t0();
    while now <= t0() + Duration::hours(7) {
        feed.push((now, 1100.0));
        now += Duration::minutes(15);
    }
    while now <= t0() + Duration::hours(13) {
        feed.push((now, 1120.0));
        now += Duration::minutes(15);
    }
    feed.push((now, 1160.0));
    feed
}

#[test]
fn test_recovery_fires_once_per_low_point() {
    let config = MonitorConfig::default();
    let mut state = PersistentState::default();
    let mut actuator = DryRunActuator::new();

    let mut feed = |gallons: f64, now: DateTime<Utc>, state: &mut PersistentState| {
        let snap = snapshot(now, gallons, false);
        let report = engine::tick(Some(&snap), now, &config, state, &mut actuator);
        count(&report.events, "well_recovered")
    };

    let script = recovery_feed();
    let (last_at, _) = script[script.len() - 1];
    let mut before = 0;
    for &(at, g) in &script[..script.len() - 1] {
        before += feed(g, at, &mut state);
    }
    assert_eq!(before, 0);
    assert_eq!(state.stagnation.low_point_timestamp, Some(t0() + Duration::hours(7)));

    let mut now = last_at;
    let mut after = Vec::new();
    for gallons in [1160.0, 1105.0, 1160.0] {
        after.push(feed(gallons, now, &mut state));
        now += Duration::minutes(15);
    }
    assert_eq!(after, vec![1, 0, 0]);
}

#[test]
fn test_restart_does_not_refire_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = MonitorConfig::default();

    let script = recovery_feed();
    let events = run_feed(&path, &config, &script);
    assert_eq!(count(&events, "well_recovered"), 1);

    let (last_at, _) = script[script.len() - 1];
    let after: Vec<_> = [1160.0, 1105.0, 1160.0]
        .into_iter()
        .enumerate()
        .map(|(i, g)| (last_at + Duration::minutes(15 * (i as i64 + 1)), g))
        .collect();
    let events = run_feed(&path, &config, &after);
    assert_eq!(count(&events, "well_recovered"), 0);
}

// ---------------------------------------------------------------------------
// Backflush (one-minute ticks)
// ---------------------------------------------------------------------------

/// 00:50 to 02:30 UTC, one reading a minute: flat at 1200, a 100 gal drop
/// between 01:31 and 01:40, then flat at 1100.
fn backflush_feed() -> Vec<(DateTime<Utc>, f64)> {
    let start = Utc.with_ymd_and_hms(2024, 5, 2, 0, 50, 0).unwrap();
    let levels = (0..=100).map(|m| match m {
        0..=40 => 1200.0,
        41..=50 => 1200.0 - 10.0 * (m - 40) as f64,
        _ => 1100.0,
    });
    minute_feed(start, levels)
}

#[test]
fn test_backflush_on_minute_ticks_fires_once() {
    let dir = tempfile::tempdir().unwrap();
    let feed = backflush_feed();
    let mut source = ManualSource::new();
    for &(at, g) in &feed {
        source.push(snapshot(at, g, false));
    }

    let mut m = monitor(&dir.path().join("state.json"), MonitorConfig::default(), source);
    let mut fired_at = Vec::new();
    for &(at, _) in &feed {
        let report = m.run_tick_at(at).unwrap();
        if count(&report.events, "backflush") > 0 {
            fired_at.push(at);
        }
    }

    // The drop reaches 50 gal below the last sampled peak at 01:35.
    assert_eq!(fired_at, vec![Utc.with_ymd_and_hms(2024, 5, 2, 1, 35, 0).unwrap()]);
    assert_eq!(
        m.state().backflush.last_drop_started_at,
        Some(Utc.with_ymd_and_hms(2024, 5, 2, 1, 20, 0).unwrap())
    );
}

#[test]
fn test_restart_during_drain_does_not_repeat_backflush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = MonitorConfig::default();
    let feed = backflush_feed();
    // Stop at 01:37, two minutes into the drain after the alert.
    let (first, rest) = feed.split_at(48);

    assert_eq!(count(&run_feed(&path, &config, first), "backflush"), 1);
    assert_eq!(count(&run_feed(&path, &config, rest), "backflush"), 0);
}

// ---------------------------------------------------------------------------
// High flow (one-minute ticks)
// ---------------------------------------------------------------------------

#[test]
fn test_high_flow_on_minute_ticks_fires_once_per_episode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = MonitorConfig::default();

    // 180 GPH for 90 minutes, flat for 90 minutes, then 180 GPH again.
    let levels = (0..=270).map(|m| match m {
        0..=90 => 700.0 + 3.0 * m as f64,
        91..=180 => 970.0,
        _ => 970.0 + 3.0 * (m - 180) as f64,
    });
    let feed = minute_feed(t0(), levels);
    let (first, rest) = feed.split_at(91);
    let (flat, second) = rest.split_at(90);

    let mut source = ManualSource::new();
    for &(at, g) in &feed {
        source.push(snapshot(at, g, false));
    }
    let mut m = monitor(&path, config, source);
    assert_eq!(tally(&mut m, first, "high_flow"), 1);
    assert_eq!(tally(&mut m, flat, "high_flow"), 0);
    assert!(m.state().high_flow.is_armed(), "rate back under the limit should re-arm");
    assert_eq!(tally(&mut m, second, "high_flow"), 1);
}

// ---------------------------------------------------------------------------
// Fill rates
// ---------------------------------------------------------------------------

#[test]
fn test_fill_rates_computed_from_archived_ticks() {
    let dir = tempfile::tempdir().unwrap();
    // 12:00 to 18:55 every five minutes at 120 GPH with override on.
    let feed: Vec<_> = (0..84)
        .map(|i| (t0() + Duration::minutes(5 * i), 500.0 + 10.0 * i as f64))
        .collect();
    let mut source = ManualSource::new();
    for &(at, g) in &feed {
        source.push(snapshot(at, g, true));
    }

    let mut m = monitor(&dir.path().join("state.json"), MonitorConfig::default(), source);
    for &(at, _) in &feed {
        m.run_tick_at(at).unwrap();
    }

    let rates = m.fill_rates().expect("fill rates should be cached");
    assert_eq!(rates.on_windows, 1);
    assert_eq!(rates.off_windows, 0);
    let gph = rates.override_on_gph.expect("one qualifying override-on window");
    assert!((gph - 120.0).abs() < 1e-6, "gph was {}", gph);
    assert_eq!(rates.override_off_gph, None);
}
