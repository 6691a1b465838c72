use std::env;
use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tankmon_service::config::{ConfigLoader, MonitorConfig};
use tankmon_service::db::{MemoryArchive, PgArchive, SnapshotArchive};
use tankmon_service::dev_mode::{DevMode, ReplaySource};
use tankmon_service::ingest::SnapshotSource;
use tankmon_service::ingest::http::HttpSnapshotSource;
use tankmon_service::logging;
use tankmon_service::monitor::Monitor;
use tankmon_service::notify::{EventDispatcher, LogDispatcher, WebhookDispatcher};
use tankmon_service::relay::{DryRunActuator, HttpRelayActuator, RelayActuator};
use tankmon_service::state::StateStore;
use tokio::signal;
use tokio::time::{MissedTickBehavior, interval};

const USAGE: &str = "usage: tankmon_service [CONFIG.toml] [--replay-days N]";

#[derive(Debug, Default)]
struct Args {
    config_path: Option<String>,
    replay_days: Option<i64>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--replay-days" => {
                let value = args.next().ok_or(USAGE)?;
                let days = value
                    .parse::<i64>()
                    .map_err(|_| format!("--replay-days expects a whole number of days, got '{}'", value))?;
                parsed.replay_days = Some(days);
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ if parsed.config_path.is_none() && !arg.starts_with('-') => parsed.config_path = Some(arg),
            _ => return Err(format!("unexpected argument '{}'\n{}", arg, USAGE)),
        }
    }
    Ok(parsed)
}

fn build_source(config: &MonitorConfig, replay_days: Option<i64>) -> Result<Box<dyn SnapshotSource>, Box<dyn Error>> {
    match replay_days {
        Some(days) => {
            let dev = DevMode::new(days);
            let mut archive = PgArchive::connect_from_env()?;
            match archive.data_range()? {
                Some((start, end)) => tracing::info!(
                    days,
                    archive_start = %start,
                    archive_end = %end,
                    replaying_from = %dev.simulated_time(chrono::Utc::now()),
                    "dev mode: replaying archived snapshots"
                ),
                None => tracing::warn!(days, "dev mode: tank_snapshots is empty, every tick will see no data"),
            }
            Ok(Box::new(ReplaySource::new(dev, archive.into_client())))
        }
        None => Ok(Box::new(HttpSnapshotSource::new(
            config.source.url.clone(),
            Duration::from_secs(config.poll.fetch_timeout_secs),
        )?)),
    }
}

fn build_archive(config: &MonitorConfig, replaying: bool) -> Box<dyn SnapshotArchive> {
    let memory = || Box::new(MemoryArchive::new(chrono::Duration::days(config.gph.lookback_days)));

    // Replayed snapshots are shifted in time and must not go back into the table.
    if replaying || env::var("DATABASE_URL").is_err() {
        tracing::info!("archiving snapshots in memory");
        return memory();
    }

    match PgArchive::connect_from_env() {
        Ok(archive) => {
            tracing::info!("archiving snapshots to PostgreSQL");
            Box::new(archive)
        }
        Err(e) => {
            tracing::warn!(error = %e, "database unavailable, archiving snapshots in memory");
            memory()
        }
    }
}

fn build_dispatchers(config: &MonitorConfig) -> Result<Vec<Box<dyn EventDispatcher>>, Box<dyn Error>> {
    let mut dispatchers: Vec<Box<dyn EventDispatcher>> = vec![Box::new(LogDispatcher)];
    if let Some(url) = &config.notify.webhook_url {
        dispatchers.push(Box::new(WebhookDispatcher::new(
            url.clone(),
            config.notify.min_severity,
            Duration::from_secs(config.notify.timeout_secs),
        )?));
    }
    Ok(dispatchers)
}

fn build_actuator(config: &MonitorConfig) -> Result<Box<dyn RelayActuator>, Box<dyn Error>> {
    match &config.relay.bridge_url {
        Some(url) => Ok(Box::new(HttpRelayActuator::new(
            url.clone(),
            Duration::from_secs(config.relay.timeout_secs),
        )?)),
        None => {
            tracing::warn!("no relay bridge configured, relay commands will only be logged");
            Ok(Box::new(DryRunActuator::new()))
        }
    }
}

/// Resolves on ctrl-c, or on SIGTERM where there is one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, ctrl-c only");
                wait_for_ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = wait_for_ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn run(monitor: Arc<Mutex<Monitor>>, every: Duration, shutdown: impl Future<Output = ()>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Awaited inside the branch so shutdown never interrupts a tick mid-save.
                let monitor = Arc::clone(&monitor);
                let outcome = tokio::task::spawn_blocking(move || {
                    let mut guard = monitor.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.run_tick()
                })
                .await;

                match outcome {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "tick failed"),
                    Err(e) => tracing::error!(error = %e, "tick aborted, skipping"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();

    let args = parse_args(env::args().skip(1))?;
    let config_path = args.config_path.clone().or_else(|| env::var("TANKMON_CONFIG").ok());

    let loader = match &config_path {
        Some(path) => ConfigLoader::open(path)?,
        None => ConfigLoader::fixed(MonitorConfig::default()),
    };
    let config = loader.current().clone();

    if let Err(e) = logging::init_logging(&config.logging.level, config.logging.file.as_deref()) {
        tracing::warn!(error = %e, "could not open log file, logging to console only");
    }
    tracing::info!(
        config = config_path.as_deref().unwrap_or("<defaults>"),
        interval_secs = config.poll.tank_interval_secs,
        "tankmon_service starting"
    );

    let store = StateStore::open(&config.state.path)?;
    let monitor = Monitor::new(
        loader,
        store,
        build_source(&config, args.replay_days)?,
        build_archive(&config, args.replay_days.is_some()),
        build_dispatchers(&config)?,
        build_actuator(&config)?,
    );
    let monitor = Arc::new(Mutex::new(monitor));

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(
        Arc::clone(&monitor),
        Duration::from_secs(config.poll.tank_interval_secs.max(1)),
        shutdown_signal(),
    ));
    drop(runtime);

    tracing::info!("tankmon_service stopped");
    Ok(())
}
