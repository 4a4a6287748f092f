use std::sync::Arc;
use std::time::Duration;

use dial_daemon::cache::ResolutionCache;
use dial_daemon::catalog::StationDirectory;
use dial_daemon::core::{ControllerDeps, DaemonEvent, TuningController};
use dial_daemon::engine::{MediaEngine, NullEngine};
use dial_daemon::latency::LoadTimeTracker;
use dial_daemon::mpv::MpvEngine;
use dial_daemon::session::PlaybackSession;
use dial_daemon::store::FileStore;
use dial_daemon::{logging, socket, BroadcastMessage};
use dial_proto::config::{Config, EngineKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so the log layer can forward warnings.
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let log_path = logging::init(&dial_proto::platform::data_dir(), broadcast_tx.clone())?;
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let engine: Arc<dyn MediaEngine> = match config.playback.engine {
        EngineKind::Mpv => match MpvEngine::new() {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                warn!("{:#}; falling back to the null engine", e);
                Arc::new(NullEngine::new())
            }
        },
        EngineKind::Null => Arc::new(NullEngine::new()),
    };

    let cache = Arc::new(ResolutionCache::<String>::new(Duration::from_secs(
        config.cache.max_age_secs,
    )));
    let _sweeper = cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));

    // Event channel: all external inputs funnel into the controller.
    let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(256);

    let session = PlaybackSession::new(engine, cache, event_tx.clone(), &config.playback)?;
    let deps = ControllerDeps {
        directory: Arc::new(StationDirectory::new(&config)?),
        tracker: Arc::new(LoadTimeTracker::new()),
        store: Arc::new(FileStore::new(config.daemon.store_dir.clone())),
        session,
        state_file: Some(config.daemon.state_file.clone()),
    };
    let controller =
        TuningController::new(config.clone(), deps, event_tx.clone(), broadcast_tx.clone()).await;

    if config.control.enabled {
        let listener = socket::bind(&config.control.bind_address, config.control.port).await?;
        let _socket_handle = socket::start_server(
            listener,
            controller.state_manager(),
            event_tx.clone(),
            broadcast_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(DaemonEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    controller.run(event_rx).await
}
