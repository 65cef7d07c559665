use anyhow::{Context, Result};
use event_sync::api::RestApi;
use event_sync::config::{self, Config};
use event_sync::db;
use event_sync::messaging::{self, EventNotifier, EventType};
use event_sync::scheduler::{CameraHealthTask, RetentionTask, Scheduler, SyncPollTask};
use event_sync::stores::{FsArchiveStore, FsTransferStore, HttpDeviceClient};
use event_sync::sync::{SyncEngine, SystemClock};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EVENT_SYNC_CONFIG").ok())
        .map(PathBuf::from)
}

fn init_logging(config: &Config) {
    // RUST_LOG wins over the configured level
    let env = env_logger::Env::default().default_filter_or(config.api.log_level.clone());
    env_logger::Builder::from_env(env).init();
}

async fn run_app() -> Result<()> {
    let config = config::load_config(config_path().as_deref())?;
    init_logging(&config);
    info!("Starting event sync service");
    info!("Configuration loaded, {} cameras", config.cameras.len());

    let store = db::connect_event_store(&config.database)
        .await
        .context("Failed to open event store")?;

    let broker = messaging::create_message_broker(config.message_broker.clone()).await?;
    info!("Message broker initialized");
    let notifier = EventNotifier::new(broker);

    tokio::fs::create_dir_all(&config.archive.root)
        .await
        .with_context(|| format!("Failed to create archive root {:?}", config.archive.root))?;

    let device = Arc::new(HttpDeviceClient::new(config.probe.call_timeout())?);
    let transfer = Arc::new(FsTransferStore::new(&config.transfer));
    let archive = Arc::new(FsArchiveStore::new(&config.archive));

    let engine = Arc::new(SyncEngine::new(
        &config,
        store,
        device,
        transfer,
        archive,
        Arc::new(SystemClock),
        notifier.clone(),
    ));

    notifier.system(EventType::SystemStartup, "event-sync").await;

    let scheduler = Scheduler::new();
    scheduler
        .spawn_periodic(
            "retention sweeper",
            Duration::from_secs(config.retention.check_interval_secs.max(1)),
            Arc::new(RetentionTask::new(engine.retention().clone())),
        )
        .await;
    if config.sync.poll_interval_secs > 0 {
        scheduler
            .spawn_periodic(
                "sync poller",
                Duration::from_secs(config.sync.poll_interval_secs),
                Arc::new(SyncPollTask::new(engine.clone())),
            )
            .await;
    } else {
        warn!("Background sync poller disabled");
    }
    if config.sync.health_check_interval_secs > 0 {
        scheduler
            .spawn_periodic(
                "camera health check",
                Duration::from_secs(config.sync.health_check_interval_secs),
                Arc::new(CameraHealthTask::new(engine.health().clone())),
            )
            .await;
    }

    let shutdown = CancellationToken::new();
    let api = RestApi::new(&config.api, engine.clone());
    let api_shutdown = shutdown.clone();
    let api_task = tokio::spawn(async move { api.run(api_shutdown).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.cancel();
    scheduler.shutdown().await;
    info!("Scheduler stopped");
    engine.shutdown().await;

    match api_task.await {
        Ok(Err(e)) => error!("API server failed: {}", e),
        Err(e) => error!("API server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    notifier.system(EventType::SystemShutdown, "event-sync").await;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_app().await {
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
