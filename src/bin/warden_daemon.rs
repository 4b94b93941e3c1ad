use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use streamwarden::cache::ActiveSessionCache;
use streamwarden::config::Config;
use streamwarden::events::EventBus;
use streamwarden::geolocation::open_resolver;
use streamwarden::lifecycle::{LifecycleEngine, LifecycleSettings};
use streamwarden::normalizer::Normalizer;
use streamwarden::output::EventSink;
use streamwarden::persistence::{seed_rules, SessionStore, SqliteStore};
use streamwarden::poller::{PollWorker, SessionPipeline};
use streamwarden::violations::ViolationRecorder;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Session tracking daemon: polls every configured media server until Ctrl+C
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting Streamwarden daemon...");

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("Config file not found, using defaults");
        Config::default()
    };

    let store: Arc<dyn SessionStore> = Arc::new(
        SqliteStore::new(&config.storage.database_path)?.with_initial_trust(config.trust.initial_score),
    );
    let seeded = seed_rules(store.as_ref(), &config.rules)?;
    if seeded > 0 {
        log::info!("Seeded {} rule(s) from config", seeded);
    }

    let cache = Arc::new(ActiveSessionCache::new());
    let restored = cache.resync(store.as_ref())?;
    log::info!("Restored {} active session(s)", restored);

    let events = EventBus::default();
    let sink = EventSink::from_config(&config.output)?;
    let sink_task = tokio::spawn(sink.run(events.subscribe()));

    let pipeline = Arc::new(SessionPipeline::new(
        Normalizer::new(open_resolver(config.geoip.database_path.as_deref())),
        LifecycleEngine::new(
            store.clone(),
            cache.clone(),
            events.clone(),
            LifecycleSettings::from_config(&config),
        ),
        ViolationRecorder::new(store.clone(), events.clone(), config.trust.clone()),
        store.clone(),
        cache.clone(),
        config.poller.history_window_hours,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        let _ = shutdown_tx.send(true);
    })?;

    let mut workers = Vec::new();
    for server in &config.servers {
        match PollWorker::new(server.clone(), &config, pipeline.clone(), events.clone()) {
            Ok(worker) => workers.push(tokio::spawn(worker.run(shutdown_rx.clone()))),
            Err(e) => log::error!("Skipping server {}: {}", server.id, e),
        }
    }
    if workers.is_empty() {
        log::warn!("No media servers to poll");
    }

    let prune_task = tokio::spawn(prune_loop(
        store.clone(),
        config.storage.retention_days,
        shutdown_rx.clone(),
    ));

    log::info!("Daemon running. Press Ctrl+C to stop.");

    let mut shutdown = shutdown_rx;
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    for worker in workers {
        if let Err(e) = worker.await {
            log::error!("Poller task failed: {}", e);
        }
    }
    if let Err(e) = prune_task.await {
        log::error!("Prune task failed: {}", e);
    }

    // The sink finishes once every publisher is gone
    drop(pipeline);
    drop(events);
    if tokio::time::timeout(Duration::from_secs(5), sink_task).await.is_err() {
        log::warn!("Event sink did not drain in time");
    }

    log::info!("Streamwarden daemon stopped");
    Ok(())
}

/// Periodically drop stopped sessions and acknowledged violations past retention
async fn prune_loop(store: Arc<dyn SessionStore>, retention_days: i64, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                match store.prune_old_data(cutoff) {
                    Ok(0) => {}
                    Ok(n) => log::info!("Pruned {} old record(s)", n),
                    Err(e) => log::error!("Prune failed: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
