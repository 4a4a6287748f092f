//! Media engine seam.
//!
//! The daemon never decodes audio itself.  A session hands the engine either
//! a pipe of demultiplexed audio bytes (direct streams, ICY metadata already
//! stripped) or a URL the engine fetches on its own (HLS).

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// What the engine should play.
#[derive(Debug)]
pub enum MediaSource {
    /// Raw container bytes; the channel closing marks end of stream.
    Pipe(mpsc::Receiver<Vec<u8>>),
    /// A URL the engine opens itself.
    Url(String),
}

impl MediaSource {
    pub fn describe(&self) -> String {
        match self {
            MediaSource::Pipe(_) => "pipe".to_string(),
            MediaSource::Url(url) => url.clone(),
        }
    }
}

/// Coarse engine progress for the loaded source.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    /// Nothing loaded.
    Idle,
    /// Loaded, no audio out yet.
    Starting,
    Playing,
    /// The engine gave up on the source.
    Exited(String),
}

#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Replace whatever is playing with `source`.
    async fn load(&self, source: MediaSource, volume: f32) -> anyhow::Result<()>;

    /// Idempotent.
    async fn stop(&self);

    async fn set_volume(&self, volume: f32) -> anyhow::Result<()>;

    /// Current playback rate; `Some(0.0)` means loaded but not advancing.
    /// `None` when nothing is loaded or the engine cannot tell.
    async fn playback_rate(&self) -> Option<f64>;

    /// Un-pause a loaded source.
    async fn resume(&self) -> anyhow::Result<()>;

    async fn status(&self) -> EngineStatus;
}

enum NullSource {
    Draining(JoinHandle<u64>),
    Url(String),
}

impl NullSource {
    fn discard(self) {
        match self {
            NullSource::Draining(task) => task.abort(),
            NullSource::Url(url) => debug!("null engine: dropping {}", url),
        }
    }
}

/// Discards audio.  Used for headless runs where only metadata and load
/// statistics matter.
#[derive(Default)]
pub struct NullEngine {
    loaded: Mutex<Option<NullSource>>,
}

impl NullEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaEngine for NullEngine {
    async fn load(&self, source: MediaSource, _volume: f32) -> anyhow::Result<()> {
        let mut loaded = self.loaded.lock().await;
        if let Some(prev) = loaded.take() {
            prev.discard();
        }
        *loaded = Some(match source {
            MediaSource::Pipe(mut rx) => NullSource::Draining(tokio::spawn(async move {
                let mut total = 0u64;
                while let Some(chunk) = rx.recv().await {
                    total += chunk.len() as u64;
                }
                debug!("null engine: pipe closed after {} bytes", total);
                total
            })),
            MediaSource::Url(url) => NullSource::Url(url),
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(prev) = self.loaded.lock().await.take() {
            prev.discard();
        }
    }

    async fn set_volume(&self, _volume: f32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn playback_rate(&self) -> Option<f64> {
        self.loaded.lock().await.as_ref().map(|_| 1.0)
    }

    async fn resume(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn status(&self) -> EngineStatus {
        match self.loaded.lock().await.as_ref() {
            Some(_) => EngineStatus::Playing,
            None => EngineStatus::Idle,
        }
    }
}
