//! PlaybackSession: at most one live stream at a time.
//!
//! `open()` tears down whatever was playing, then spawns a pump task that
//! resolves the station URL, connects, demultiplexes ICY metadata and feeds
//! audio to the media engine.  Progress comes back to the controller as
//! `SessionEvent`s tagged with the generation passed to `open()`; the session
//! itself never decides whether an event is stale.
//!
//! The volume lives in a watch channel so a change made while a stream is
//! still resolving is picked up when the engine is finally loaded.

use std::sync::Arc;
use std::time::Duration;

use dial_proto::config::PlaybackConfig;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ResolutionCache;
use crate::core::DaemonEvent;
use crate::engine::{EngineStatus, MediaEngine, MediaSource};
use crate::icy::{IcyHeaders, MetadataFrame, MetadataFrameParser};
use crate::playlist::{self, StreamKind};

/// Audio chunks buffered between the network and the engine.
const AUDIO_PIPE_DEPTH: usize = 64;

/// How often a URL source is checked while the engine fetches it itself.
const ENGINE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// Enough audio reached the engine to start playback.
    Ready,
    /// New now-playing title (consecutive duplicates are suppressed).
    Title(String),
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server answered HTTP {0}")]
    HttpStatus(u16),
    #[error("media engine: {0}")]
    Engine(String),
    #[error("stream ended")]
    StreamEnded,
}

/// Where a station URL finally leads.
#[derive(Debug, Clone, PartialEq)]
enum Target {
    Direct(String),
    Hls(String),
}

/// Everything the pump task needs; cloned per open.
#[derive(Clone)]
struct PumpContext {
    client: reqwest::Client,
    engine: Arc<dyn MediaEngine>,
    cache: Arc<ResolutionCache<String>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    volume: watch::Receiver<f32>,
    prebuffer_bytes: usize,
    fetch_timeout: Duration,
}

struct ActiveStream {
    generation: u64,
    url: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PlaybackSession {
    ctx: PumpContext,
    volume: watch::Sender<f32>,
    active: Option<ActiveStream>,
}

impl PlaybackSession {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        cache: Arc<ResolutionCache<String>>,
        event_tx: mpsc::Sender<DaemonEvent>,
        config: &PlaybackConfig,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("Icy-MetaData", HeaderValue::from_static("1"));
        let client = reqwest::Client::builder()
            .user_agent(concat!("fmdial/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        let (volume, volume_rx) = watch::channel(config.default_volume.clamp(0.0, 1.0));

        Ok(Self {
            ctx: PumpContext {
                client,
                engine,
                cache,
                event_tx,
                volume: volume_rx,
                prebuffer_bytes: config.prebuffer_bytes.max(1),
                fetch_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            },
            volume,
            active: None,
        })
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.ctx.engine
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn generation(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.generation)
    }

    pub fn url(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.url.as_str())
    }

    pub fn volume(&self) -> f32 {
        *self.volume.borrow()
    }

    /// Remember `volume` for the next load and apply it to a live stream.
    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.volume.send_replace(volume);
        if self.is_open() {
            self.ctx.engine.set_volume(volume).await?;
        }
        Ok(())
    }

    /// Start acquiring `url`.  Any previous stream is closed first.
    pub async fn open(&mut self, url: &str, generation: u64) {
        self.close().await;

        info!("session: open gen={} {}", generation, url);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(
            self.ctx.clone(),
            url.to_string(),
            generation,
            cancel.clone(),
        ));
        self.active = Some(ActiveStream {
            generation,
            url: url.to_string(),
            cancel,
            task,
        });
    }

    /// Safe to call when nothing is open.
    pub async fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        debug!("session: close gen={}", active.generation);
        active.cancel.cancel();
        active.task.abort();
        self.ctx.engine.stop().await;
    }
}

async fn pump(
    ctx: PumpContext,
    url: String,
    generation: u64,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = run_stream(&ctx, &url, generation) => r,
    };

    if let Err(e) = result {
        if cancel.is_cancelled() {
            return;
        }
        warn!("session: gen={} {}: {}", generation, url, e);
        emit(&ctx, generation, SessionEventKind::Failed(e.to_string())).await;
    }
}

async fn emit(ctx: &PumpContext, generation: u64, kind: SessionEventKind) {
    let event = DaemonEvent::Session(SessionEvent { generation, kind });
    if ctx.event_tx.send(event).await.is_err() {
        debug!("session: controller gone, dropping event");
    }
}

async fn run_stream(ctx: &PumpContext, url: &str, generation: u64) -> Result<(), SessionError> {
    match resolve(ctx, url).await? {
        Target::Hls(manifest) => {
            info!("session: HLS manifest {}", manifest);
            play_url(ctx, &manifest, generation).await
        }
        Target::Direct(stream_url) => stream_direct(ctx, &stream_url, generation).await,
    }
}

/// Load `source` at the current volume.  A change that lands while the
/// engine is starting is re-applied afterwards.
async fn load_engine(ctx: &PumpContext, source: MediaSource) -> Result<(), SessionError> {
    let volume = *ctx.volume.borrow();
    ctx.engine
        .load(source, volume)
        .await
        .map_err(|e| SessionError::Engine(e.to_string()))?;
    let latest = *ctx.volume.borrow();
    if latest != volume {
        ctx.engine
            .set_volume(latest)
            .await
            .map_err(|e| SessionError::Engine(e.to_string()))?;
    }
    Ok(())
}

/// The engine fetches `url` itself.  Ready is sent once it reports audio
/// out; the pump then stays to report the engine giving up.
async fn play_url(ctx: &PumpContext, url: &str, generation: u64) -> Result<(), SessionError> {
    load_engine(ctx, MediaSource::Url(url.to_string())).await?;

    let mut poll = tokio::time::interval(ENGINE_POLL_INTERVAL);
    let mut ready = false;
    loop {
        poll.tick().await;
        match ctx.engine.status().await {
            EngineStatus::Starting => {}
            EngineStatus::Playing => {
                if !ready {
                    ready = true;
                    debug!("session: gen={} engine is playing {}", generation, url);
                    emit(ctx, generation, SessionEventKind::Ready).await;
                }
            }
            EngineStatus::Exited(reason) => return Err(SessionError::Engine(reason)),
            EngineStatus::Idle => {
                return Err(SessionError::Engine("source was unloaded".to_string()))
            }
        }
    }
}

/// Map a station URL onto a playable target.  Playlist resolutions are
/// cached; a playlist with nothing usable falls back to the original URL.
async fn resolve(ctx: &PumpContext, url: &str) -> Result<Target, SessionError> {
    let kind = playlist::classify_url(url);
    if kind == StreamKind::Direct {
        return Ok(Target::Direct(url.to_string()));
    }

    if let Some(cached) = ctx.cache.get(url).await {
        debug!("session: cached resolution {} → {}", url, cached);
        return Ok(Target::Direct(cached));
    }

    let body = fetch_text(ctx, url).await?;

    let format = match kind {
        StreamKind::Hls if playlist::is_hls_manifest(&body) => {
            return Ok(Target::Hls(url.to_string()));
        }
        StreamKind::Hls => playlist::PlaylistFormat::M3u,
        StreamKind::Playlist(format) => format,
        StreamKind::Direct => return Ok(Target::Direct(url.to_string())),
    };

    match playlist::extract_stream_url(format, &body, url) {
        Some(stream_url) => {
            info!("session: playlist {} → {}", url, stream_url);
            ctx.cache.put(url, stream_url.clone()).await;
            Ok(Target::Direct(stream_url))
        }
        None => {
            warn!("session: no stream entry in {}, trying it directly", url);
            Ok(Target::Direct(url.to_string()))
        }
    }
}

async fn fetch_text(ctx: &PumpContext, url: &str) -> Result<String, SessionError> {
    let response = ctx
        .client
        .get(url)
        .timeout(ctx.fetch_timeout)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SessionError::HttpStatus(status.as_u16()));
    }
    Ok(response.text().await?)
}

async fn stream_direct(
    ctx: &PumpContext,
    url: &str,
    generation: u64,
) -> Result<(), SessionError> {
    let response = ctx.client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SessionError::HttpStatus(status.as_u16()));
    }

    let icy = IcyHeaders::from_headers(response.headers());
    info!(
        "session: connected gen={} metaint={} name={:?} type={:?} br={:?}",
        generation, icy.metaint, icy.station_name, icy.content_type, icy.bitrate
    );

    let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_PIPE_DEPTH);
    load_engine(ctx, MediaSource::Pipe(audio_rx)).await?;

    let mut parser = MetadataFrameParser::new(icy.metaint);
    let mut body = response.bytes_stream();
    let mut delivered = 0usize;
    let mut ready = false;
    let mut last_title: Option<String> = None;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for frame in parser.feed(&chunk) {
            match frame {
                MetadataFrame::Audio(bytes) => {
                    delivered += bytes.len();
                    if audio_tx.send(bytes).await.is_err() {
                        return Err(SessionError::Engine("audio sink closed".to_string()));
                    }
                }
                MetadataFrame::Title(title) => {
                    if last_title.as_deref() == Some(title.as_str()) {
                        continue;
                    }
                    debug!("session: gen={} title {:?}", generation, title);
                    last_title = Some(title.clone());
                    emit(ctx, generation, SessionEventKind::Title(title)).await;
                }
            }
        }

        if !ready && delivered >= ctx.prebuffer_bytes {
            ready = true;
            debug!("session: gen={} ready after {} bytes", generation, delivered);
            emit(ctx, generation, SessionEventKind::Ready).await;
        }
    }

    Err(SessionError::StreamEnded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NullEngine;

    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn session(event_tx: mpsc::Sender<DaemonEvent>) -> PlaybackSession {
        session_with(event_tx, Arc::new(NullEngine::new()))
    }

    fn session_with(
        event_tx: mpsc::Sender<DaemonEvent>,
        engine: Arc<dyn MediaEngine>,
    ) -> PlaybackSession {
        PlaybackSession::new(
            engine,
            Arc::new(ResolutionCache::new(Duration::from_secs(3600))),
            event_tx,
            &PlaybackConfig::default(),
        )
        .unwrap()
    }

    /// Engine that walks through a fixed list of statuses, one per poll,
    /// repeating the last one.
    struct ScriptedStatus {
        script: Vec<EngineStatus>,
        polls: AtomicUsize,
        load_volumes: Mutex<Vec<f32>>,
    }

    impl ScriptedStatus {
        fn new(script: Vec<EngineStatus>) -> Self {
            Self {
                script,
                polls: AtomicUsize::new(0),
                load_volumes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaEngine for ScriptedStatus {
        async fn load(&self, _source: MediaSource, volume: f32) -> anyhow::Result<()> {
            self.load_volumes.lock().unwrap().push(volume);
            Ok(())
        }
        async fn stop(&self) {}
        async fn set_volume(&self, _volume: f32) -> anyhow::Result<()> {
            Ok(())
        }
        async fn playback_rate(&self) -> Option<f64> {
            Some(1.0)
        }
        async fn resume(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn status(&self) -> EngineStatus {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            self.script[n.min(self.script.len() - 1)].clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_source_ready_waits_for_engine_then_reports_exit() {
        let (tx, mut rx) = mpsc::channel(8);
        let engine = Arc::new(ScriptedStatus::new(vec![
            EngineStatus::Starting,
            EngineStatus::Starting,
            EngineStatus::Playing,
            EngineStatus::Playing,
            EngineStatus::Exited("mpv exited (exit status: 2)".to_string()),
        ]));
        let session = session_with(tx, engine.clone());

        let result = play_url(&session.ctx, "http://h/live.m3u8", 3).await;
        match result {
            Err(SessionError::Engine(reason)) => assert!(reason.contains("exit status: 2")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            rx.try_recv().ok().map(|e| match e {
                DaemonEvent::Session(ev) => ev,
                other => panic!("unexpected event: {:?}", other),
            }),
            Some(SessionEvent {
                generation: 3,
                kind: SessionEventKind::Ready
            })
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_source_that_never_plays_sends_no_ready() {
        let (tx, mut rx) = mpsc::channel(8);
        let engine = Arc::new(ScriptedStatus::new(vec![
            EngineStatus::Starting,
            EngineStatus::Exited("mpv exited (exit status: 1)".to_string()),
        ]));
        let session = session_with(tx, engine);

        assert!(play_url(&session.ctx, "http://h/live.m3u8", 1).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_engine_is_loaded_with_latest_volume() {
        let (tx, _rx) = mpsc::channel(8);
        let engine = Arc::new(ScriptedStatus::new(vec![EngineStatus::Playing]));
        let session = session_with(tx, engine.clone());

        // Not open yet: only remembered.
        session.set_volume(0.9).await.unwrap();
        assert_eq!(session.volume(), 0.9);

        load_engine(&session.ctx, MediaSource::Url("http://h/a.m3u8".to_string()))
            .await
            .unwrap();
        assert_eq!(*engine.load_volumes.lock().unwrap(), vec![0.9]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let mut session = session(tx);
        session.close().await;
        assert!(!session.is_open());
        session.close().await;
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_open_replaces_previous_stream() {
        let (tx, _rx) = mpsc::channel(8);
        let mut session = session(tx);
        session.open("unsupported://a/one", 1).await;
        session.open("unsupported://a/two", 2).await;
        assert_eq!(session.generation(), Some(2));
        assert_eq!(session.url(), Some("unsupported://a/two"));
        session.close().await;
        assert_eq!(session.generation(), None);
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported_with_generation() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = session(tx);
        session.open("unsupported://a/stream", 7).await;

        match rx.recv().await {
            Some(DaemonEvent::Session(SessionEvent {
                generation,
                kind: SessionEventKind::Failed(reason),
            })) => {
                assert_eq!(generation, 7);
                assert!(reason.starts_with("transport error"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cached_resolution_skips_fetch() {
        let (tx, _rx) = mpsc::channel(8);
        let session = session(tx);
        session
            .ctx
            .cache
            .put("http://unreachable.invalid/listen.pls", "http://cached/stream".to_string())
            .await;
        let target = resolve(&session.ctx, "http://unreachable.invalid/listen.pls")
            .await
            .unwrap();
        assert_eq!(target, Target::Direct("http://cached/stream".to_string()));
    }

    #[tokio::test]
    async fn test_direct_urls_resolve_without_io() {
        let (tx, _rx) = mpsc::channel(8);
        let session = session(tx);
        let target = resolve(&session.ctx, "http://unreachable.invalid/live.mp3")
            .await
            .unwrap();
        assert_eq!(target, Target::Direct("http://unreachable.invalid/live.mp3".to_string()));
    }
}
