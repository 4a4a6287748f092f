//! Shared fixtures: a mock ICY radio server and a daemon wired to it.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dial_daemon::cache::ResolutionCache;
use dial_daemon::catalog::{StationCatalog, StationDirectory};
use dial_daemon::core::{ControllerDeps, DaemonEvent, TuningController};
use dial_daemon::engine::{EngineStatus, MediaEngine, MediaSource};
use dial_daemon::latency::LoadTimeTracker;
use dial_daemon::session::PlaybackSession;
use dial_daemon::state::StateManager;
use dial_daemon::store::MemoryStore;
use dial_daemon::BroadcastMessage;
use dial_proto::config::Config;
use dial_proto::protocol::{Command, Genre, Station, TuningState};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const METAINT: usize = 16;
pub const MOCK_TITLE: &str = "Mock Artist - Mock Song";
pub const PLAYLIST_DELAY: Duration = Duration::from_millis(400);

/// One metadata cycle: `METAINT` audio bytes, then a title block.
pub fn icy_cycle() -> Vec<u8> {
    let text = format!("StreamTitle='{}';", MOCK_TITLE);
    let units = text.len().div_ceil(16);
    let mut out = vec![b'A'; METAINT];
    out.push(units as u8);
    out.extend_from_slice(text.as_bytes());
    out.resize(METAINT + 1 + units * 16, 0);
    out
}

// ── mock server ───────────────────────────────────────────────────────────────

pub struct MockServer {
    pub base: String,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let app = Router::new()
            .route("/live", get(live))
            .route("/plain", get(plain))
            .route("/slow", get(slow))
            .route("/listen.pls", get(pls))
            .route("/delayed.pls", get(delayed_pls))
            .route("/empty.pls", get(empty_pls))
            .route("/hls.m3u8", get(hls))
            .with_state(Arc::new(base.clone()));

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { base, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Endless ICY stream with interleaved titles.
async fn live() -> Response {
    let stream = futures_util::stream::unfold((), |_| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(icy_cycle())), ()))
    });
    Response::builder()
        .header("icy-metaint", METAINT.to_string())
        .header("icy-name", "Mock FM")
        .header("content-type", "audio/mpeg")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Endless stream without metadata.
async fn plain() -> Response {
    let stream = futures_util::stream::unfold((), |_| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(vec![b'P'; 256])), ()))
    });
    Response::builder()
        .header("content-type", "audio/mpeg")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Accepts the request and never answers in time.
async fn slow() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(60)).await;
    StatusCode::OK
}

async fn pls(State(base): State<Arc<String>>) -> String {
    format!("[playlist]\nNumberOfEntries=1\nFile1={}/live\nTitle1=Mock\n", base)
}

/// Same playlist, answered after a pause.
async fn delayed_pls(state: State<Arc<String>>) -> String {
    tokio::time::sleep(PLAYLIST_DELAY).await;
    pls(state).await
}

async fn empty_pls() -> &'static str {
    "[playlist]\nNumberOfEntries=0\n"
}

async fn hls() -> &'static str {
    "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg0.aac\n"
}

// ── recording engine ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingEngine {
    pub loads: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
    pub audio: Arc<Mutex<Vec<u8>>>,
    /// Volume passed to each `load`.
    pub load_volumes: Mutex<Vec<f32>>,
    /// Volume set on a live source.
    pub applied_volumes: Mutex<Vec<f32>>,
    /// When set, URL sources report this exit instead of playing.
    pub url_exit: Mutex<Option<String>>,
    url_loaded: Mutex<bool>,
    drain: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl MediaEngine for RecordingEngine {
    async fn load(&self, source: MediaSource, volume: f32) -> anyhow::Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.load_volumes.lock().unwrap().push(volume);
        let mut drain = self.drain.lock().await;
        if let Some(prev) = drain.take() {
            prev.abort();
        }
        *self.url_loaded.lock().unwrap() = matches!(source, MediaSource::Url(_));
        match source {
            MediaSource::Url(url) => self.urls.lock().unwrap().push(url),
            MediaSource::Pipe(mut rx) => {
                let audio = self.audio.clone();
                *drain = Some(tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        audio.lock().unwrap().extend_from_slice(&chunk);
                    }
                }));
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        *self.url_loaded.lock().unwrap() = false;
        if let Some(prev) = self.drain.lock().await.take() {
            prev.abort();
        }
    }

    async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.applied_volumes.lock().unwrap().push(volume);
        Ok(())
    }

    async fn playback_rate(&self) -> Option<f64> {
        Some(1.0)
    }

    async fn resume(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn status(&self) -> EngineStatus {
        if *self.url_loaded.lock().unwrap() {
            return match self.url_exit.lock().unwrap().clone() {
                Some(reason) => EngineStatus::Exited(reason),
                None => EngineStatus::Playing,
            };
        }
        if self.drain.lock().await.is_some() {
            EngineStatus::Playing
        } else {
            EngineStatus::Idle
        }
    }
}

// ── daemon under test ─────────────────────────────────────────────────────────

pub struct TestDaemon {
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub broadcast_tx: broadcast::Sender<BroadcastMessage>,
    pub state: Arc<StateManager>,
    pub cache: Arc<ResolutionCache<String>>,
    pub engine: Arc<RecordingEngine>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestDaemon {
    pub async fn start(stations: Vec<Station>, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.catalog.country = "US".to_string();
        config.catalog.stations_toml = "/nonexistent/stations.toml".into();
        config.playback.prebuffer_bytes = 64;
        config.playback.connect_timeout_secs = 2;
        tweak(&mut config);

        let directory = Arc::new(StationDirectory::new(&config).unwrap());
        directory.preload(StationCatalog::new("US", stations)).await;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (broadcast_tx, _) = broadcast::channel(256);
        let engine = Arc::new(RecordingEngine::default());
        let cache = Arc::new(ResolutionCache::new(Duration::from_secs(
            config.cache.max_age_secs,
        )));
        let session =
            PlaybackSession::new(engine.clone(), cache.clone(), event_tx.clone(), &config.playback)
                .unwrap();

        let controller = TuningController::new(
            config,
            ControllerDeps {
                directory,
                tracker: Arc::new(LoadTimeTracker::new()),
                store: Arc::new(MemoryStore::new()),
                session,
                state_file: None,
            },
            event_tx.clone(),
            broadcast_tx.clone(),
        )
        .await;
        let state = controller.state_manager();
        let task = tokio::spawn(controller.run(event_rx));

        Self {
            event_tx,
            broadcast_tx,
            state,
            cache,
            engine,
            task,
        }
    }

    pub async fn send(&self, cmd: Command) {
        self.event_tx
            .send(DaemonEvent::ClientCommand(cmd))
            .await
            .unwrap();
    }

    /// Poll until `pred` holds or `within` elapses; returns the last state.
    pub async fn wait_for(
        &self,
        within: Duration,
        pred: impl Fn(&TuningState) -> bool,
    ) -> TuningState {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let state = self.state.get_state().await;
            if pred(&state) || tokio::time::Instant::now() >= deadline {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        let _ = self.event_tx.send(DaemonEvent::Shutdown).await;
        let _ = self.task.await;
    }
}

pub fn station(id: &str, frequency: f64, url: String) -> Station {
    Station {
        id: id.to_string(),
        name: format!("Station {}", id.to_uppercase()),
        frequency,
        url,
        genre: Some(Genre::Music),
        sub_genre: None,
    }
}
