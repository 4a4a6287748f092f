//! TuningController: single-owner event loop for the dial.
//!
//! Every input (client commands, session progress, load timeouts) arrives as
//! a `DaemonEvent` on one channel and is handled to completion before the
//! next one, so transitions never interleave.  The controller owns the
//! `PlaybackSession` and is the only writer of `TuningState`; after each
//! change it broadcasts `BroadcastMessage::StateUpdated` (and
//! `TitleUpdated` when the now-playing title moves).
//!
//! Each load attempt gets a fresh generation number.  Session events and
//! timeouts carry the generation they were issued under; anything that does
//! not match the current one is dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dial_proto::config::Config;
use dial_proto::favorites::FavoriteSlots;
use dial_proto::protocol::{clamp_frequency, Command, Failure, Genre, PlaybackPhase, Station, TuningState};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::{self, StationCatalog, StationDirectory};
use crate::latency::LoadTimeTracker;
use crate::session::{PlaybackSession, SessionEvent, SessionEventKind};
use crate::state::StateManager;
use crate::store::KeyValueStore;
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the controller loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client.
    ClientCommand(Command),
    /// Progress from the playback session.
    Session(SessionEvent),
    /// The load timer for `generation` expired.
    LoadTimeout { generation: u64 },
    Shutdown,
}

/// Collaborators handed to the controller.
pub struct ControllerDeps {
    pub directory: Arc<StationDirectory>,
    pub tracker: Arc<LoadTimeTracker>,
    pub store: Arc<dyn KeyValueStore>,
    pub session: PlaybackSession,
    /// `None` disables persistence of country and volume.
    pub state_file: Option<PathBuf>,
}

// ── TuningController ──────────────────────────────────────────────────────────

pub struct TuningController {
    config: Config,
    state_manager: Arc<StateManager>,
    directory: Arc<StationDirectory>,
    catalog: Arc<StationCatalog>,
    session: PlaybackSession,
    tracker: Arc<LoadTimeTracker>,
    store: Arc<dyn KeyValueStore>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    generation: u64,
    /// When the current load attempt started (for latency records).
    load_started: Option<Instant>,
    timeout_task: Option<JoinHandle<()>>,
}

impl TuningController {
    pub async fn new(
        config: Config,
        deps: ControllerDeps,
        event_tx: mpsc::Sender<DaemonEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let persistent = deps
            .state_file
            .as_deref()
            .filter(|p| p.exists())
            .map(StateManager::load_persistent);
        let country = persistent
            .as_ref()
            .and_then(|p| p.country.clone())
            .unwrap_or_else(|| config.catalog.country.clone())
            .to_ascii_uppercase();
        let volume = persistent
            .as_ref()
            .map(|p| p.volume)
            .unwrap_or(config.playback.default_volume)
            .clamp(0.0, 1.0);

        if let Err(e) = deps.session.set_volume(volume).await {
            warn!("volume: could not restore {:.2}: {:#}", volume, e);
        }
        let catalog = deps.directory.load(&country).await;
        let favorites = load_favorites(deps.store.as_ref(), &country).await;
        let visible = catalog.filter(None);
        let fastest = deps
            .tracker
            .fastest(&visible, config.tuning.shortlist_size)
            .await;

        let initial = TuningState {
            country: catalog.country.clone(),
            volume,
            visible,
            fastest,
            favorites,
            ..Default::default()
        };
        info!(
            "controller: {} stations for {}, volume {:.2}",
            catalog.len(),
            catalog.country,
            volume
        );

        Self {
            state_manager: Arc::new(StateManager::new(deps.state_file, initial)),
            config,
            directory: deps.directory,
            catalog,
            session: deps.session,
            tracker: deps.tracker,
            store: deps.store,
            event_tx,
            broadcast_tx,
            generation: 0,
            load_started: None,
            timeout_task: None,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns when `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("controller: starting event loop");
        loop {
            match event_rx.recv().await {
                None => {
                    info!("controller: event channel closed, shutting down");
                    break;
                }
                Some(DaemonEvent::Shutdown) => {
                    info!("controller: shutdown requested");
                    break;
                }
                Some(event) => self.handle_event(event).await,
            }
        }
        self.halt().await;
        Ok(())
    }

    pub async fn handle_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::ClientCommand(cmd) => {
                info!("controller: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("controller: command error: {:#}", e);
                }
            }
            DaemonEvent::Session(event) => self.handle_session_event(event).await,
            DaemonEvent::LoadTimeout { generation } => self.handle_load_timeout(generation).await,
            DaemonEvent::Shutdown => {}
        }
    }

    pub async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Tune { frequency } => {
                self.tune(frequency, self.config.tuning.dial_tolerance).await
            }
            Command::Step { delta } => {
                let frequency = self.state_manager.get_state().await.frequency + delta;
                self.tune(frequency, self.config.tuning.dial_tolerance).await
            }
            Command::NextStation => self.step_station(true).await,
            Command::PrevStation => self.step_station(false).await,
            Command::SelectStation { id } => self.select_station(&id).await?,
            Command::TogglePlayPause => self.toggle_play_pause().await,
            Command::Volume { value } => self.set_volume(value).await,
            Command::SelectGenre { genre } => self.select_genre(genre).await,
            Command::SetCountry { code } => self.set_country(&code).await,
            Command::SaveFavorite { slot, station_id } => {
                self.save_favorite(slot, &station_id).await?
            }
            Command::RecallFavorite { slot } => self.recall_favorite(slot).await?,
            Command::GetState => self.notify_state(),
        }
        Ok(())
    }

    // ── tuning ────────────────────────────────────────────────────────────────

    async fn tune(&mut self, frequency: f64, tolerance: f64) {
        let frequency = clamp_frequency(frequency);
        let state = self.state_manager.get_state().await;
        let found = catalog::find_by_frequency(&state.visible, frequency, tolerance).cloned();

        match found {
            Some(station) if is_current(&state, &station) => {
                self.state_manager.modify(|s| s.frequency = frequency).await;
                self.notify_state();
            }
            Some(station) => self.start_load(station, frequency).await,
            None => {
                debug!("tune: nothing within {} of {:.2}", tolerance, frequency);
                self.halt().await;
                self.state_manager
                    .modify(|s| {
                        s.frequency = frequency;
                        s.station = None;
                        s.phase = PlaybackPhase::Idle;
                        s.failure = None;
                    })
                    .await;
                self.clear_title(&state);
                self.notify_state();
            }
        }
    }

    async fn step_station(&mut self, forward: bool) {
        let state = self.state_manager.get_state().await;
        let Some(station) = catalog::neighbour(&state.visible, state.frequency, forward).cloned()
        else {
            return;
        };
        if is_current(&state, &station) && (state.is_playing() || state.is_loading()) {
            debug!("step: {} is the only neighbour, keeping the stream", station.name);
            return;
        }
        let frequency = station.frequency;
        self.start_load(station, frequency).await;
    }

    /// Reloads only when something was playing or loading; otherwise the
    /// selection just moves.
    async fn select_station(&mut self, id: &str) -> anyhow::Result<()> {
        let station = self
            .catalog
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown station id '{}'", id))?;
        let state = self.state_manager.get_state().await;

        if state.is_playing() || state.is_loading() {
            let frequency = station.frequency;
            self.start_load(station, frequency).await;
        } else {
            info!("select: {} (not playing)", station.name);
            self.state_manager
                .modify(|s| {
                    s.frequency = station.frequency;
                    s.station = Some(station);
                    s.phase = PlaybackPhase::Idle;
                    s.failure = None;
                })
                .await;
            self.notify_state();
        }
        Ok(())
    }

    async fn toggle_play_pause(&mut self) {
        let state = self.state_manager.get_state().await;
        match state.phase {
            PlaybackPhase::Playing | PlaybackPhase::Loading | PlaybackPhase::Resolving => {
                info!("toggle: stopping");
                self.halt().await;
                self.state_manager
                    .modify(|s| {
                        s.phase = PlaybackPhase::Idle;
                        s.now_playing = None;
                    })
                    .await;
                self.clear_title(&state);
                self.notify_state();
            }
            PlaybackPhase::Idle | PlaybackPhase::Failed => match state.station {
                Some(station) => self.start_load(station, state.frequency).await,
                None => debug!("toggle: no station selected"),
            },
        }
    }

    // ── load lifecycle ────────────────────────────────────────────────────────

    async fn start_load(&mut self, station: Station, frequency: f64) {
        self.cancel_timeout();
        self.generation += 1;
        let generation = self.generation;
        info!(
            "load: {} ({:.2} MHz) gen={} volume={:.2}",
            station.name,
            station.frequency,
            generation,
            self.session.volume()
        );

        let previous = self.state_manager.get_state().await;
        let url = station.url.clone();
        self.state_manager
            .modify(|s| {
                s.frequency = clamp_frequency(frequency);
                s.station = Some(station);
                s.phase = PlaybackPhase::Resolving;
                s.now_playing = None;
                s.failure = None;
            })
            .await;
        self.clear_title(&previous);
        self.notify_state();

        self.session.open(&url, generation).await;
        self.load_started = Some(Instant::now());
        self.state_manager
            .modify(|s| s.phase = PlaybackPhase::Loading)
            .await;
        self.notify_state();
        self.arm_timeout(generation);
    }

    fn arm_timeout(&mut self, generation: u64) {
        let tx = self.event_tx.clone();
        let after = Duration::from_secs(self.config.playback.load_timeout_secs);
        self.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(DaemonEvent::LoadTimeout { generation }).await;
        }));
    }

    fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }

    /// Stop the session and invalidate everything it may still deliver.
    async fn halt(&mut self) {
        self.cancel_timeout();
        self.load_started = None;
        if self.session.is_open() {
            self.session.close().await;
            self.generation += 1;
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        if event.generation != self.generation {
            debug!(
                "session: dropping stale {:?} (gen {} != {})",
                event.kind, event.generation, self.generation
            );
            return;
        }
        let state = self.state_manager.get_state().await;

        match event.kind {
            SessionEventKind::Ready => {
                if state.phase != PlaybackPhase::Loading {
                    debug!("session: ready while {:?}, ignoring", state.phase);
                    return;
                }
                self.on_ready(state).await;
            }
            SessionEventKind::Title(title) => {
                if !matches!(state.phase, PlaybackPhase::Loading | PlaybackPhase::Playing)
                    || state.now_playing.as_deref() == Some(title.as_str())
                {
                    return;
                }
                info!("now playing: {}", title);
                self.state_manager
                    .modify(|s| s.now_playing = Some(title.clone()))
                    .await;
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::TitleUpdated(Some(title)));
                self.notify_state();
            }
            SessionEventKind::Failed(reason) => {
                if !(state.is_loading() || state.is_playing()) {
                    return;
                }
                warn!(
                    "playback failed for {}: {}",
                    station_name(&state),
                    reason
                );
                self.halt().await;
                self.state_manager
                    .modify(|s| {
                        s.phase = PlaybackPhase::Failed;
                        s.failure = Some(Failure::Error(reason));
                        s.now_playing = None;
                    })
                    .await;
                self.clear_title(&state);
                self.notify_state();
            }
        }
    }

    async fn on_ready(&mut self, state: TuningState) {
        self.cancel_timeout();
        let elapsed = self
            .load_started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        if let Some(station) = state.station.as_ref() {
            self.tracker.record(station, elapsed).await;
        }
        let fastest = self
            .tracker
            .fastest(&state.visible, self.config.tuning.shortlist_size)
            .await;

        info!(
            "playing {} after {} ms",
            station_name(&state),
            elapsed.as_millis()
        );
        self.state_manager
            .modify(|s| {
                s.phase = PlaybackPhase::Playing;
                s.last_load_ms = Some(elapsed.as_millis() as u64);
                s.failure = None;
                s.fastest = fastest;
            })
            .await;

        if self.session.engine().playback_rate().await == Some(0.0) {
            info!("engine ready but not advancing, forcing resume");
            if let Err(e) = self.session.engine().resume().await {
                warn!("forced resume failed: {:#}", e);
            }
        }
        self.notify_state();
    }

    async fn handle_load_timeout(&mut self, generation: u64) {
        if generation != self.generation {
            debug!("timeout: stale gen {} (now {})", generation, self.generation);
            return;
        }
        let state = self.state_manager.get_state().await;
        if !state.is_loading() {
            return;
        }
        warn!(
            "load timed out after {}s: {}",
            self.config.playback.load_timeout_secs,
            station_name(&state)
        );
        self.timeout_task = None;
        self.halt().await;
        self.state_manager
            .modify(|s| {
                s.phase = PlaybackPhase::Idle;
                s.failure = Some(Failure::Timeout);
                s.now_playing = None;
            })
            .await;
        self.clear_title(&state);
        self.notify_state();
    }

    // ── settings ──────────────────────────────────────────────────────────────

    async fn set_volume(&mut self, value: f32) {
        let volume = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.state_manager.modify(|s| s.volume = volume).await;
        if let Err(e) = self.session.set_volume(volume).await {
            warn!("volume: engine rejected {:.2}: {:#}", volume, e);
        }
        self.persist_state().await;
        self.notify_state();
    }

    /// Recomputes the visible list and shortlist; playback is untouched.
    async fn select_genre(&mut self, genre: Option<Genre>) {
        let visible = self.catalog.filter(genre);
        let fastest = self
            .tracker
            .fastest(&visible, self.config.tuning.shortlist_size)
            .await;
        debug!("genre: {:?} → {} stations", genre, visible.len());
        self.state_manager
            .modify(|s| {
                s.genre = genre;
                s.visible = visible;
                s.fastest = fastest;
            })
            .await;
        self.notify_state();
    }

    async fn set_country(&mut self, code: &str) {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() {
            warn!("country: empty code ignored");
            return;
        }

        self.catalog = self.directory.load(&code).await;
        let favorites = load_favorites(self.store.as_ref(), &code).await;
        let state = self.state_manager.get_state().await;
        let visible = self.catalog.filter(state.genre);
        let fastest = self
            .tracker
            .fastest(&visible, self.config.tuning.shortlist_size)
            .await;
        info!("country: {} ({} stations)", code, self.catalog.len());

        self.state_manager
            .modify(|s| {
                s.country = code;
                s.visible = visible.clone();
                s.fastest = fastest;
                s.favorites = favorites;
            })
            .await;
        self.persist_state().await;

        let was_active = state.is_playing() || state.is_loading();
        let tolerance = self.config.tuning.resync_tolerance;
        match catalog::find_by_frequency(&visible, state.frequency, tolerance).cloned() {
            Some(station) if was_active => self.start_load(station, state.frequency).await,
            Some(station) => {
                self.state_manager
                    .modify(|s| {
                        s.station = Some(station);
                        s.phase = PlaybackPhase::Idle;
                        s.failure = None;
                    })
                    .await;
                self.notify_state();
            }
            None => {
                self.halt().await;
                self.state_manager
                    .modify(|s| {
                        s.station = None;
                        s.phase = PlaybackPhase::Idle;
                        s.failure = None;
                        s.now_playing = None;
                    })
                    .await;
                self.clear_title(&state);
                self.notify_state();
            }
        }
    }

    // ── favorites ─────────────────────────────────────────────────────────────

    async fn save_favorite(&mut self, slot: usize, station_id: &str) -> anyhow::Result<()> {
        let state = self.state_manager.get_state().await;
        let station = self
            .catalog
            .get(station_id)
            .cloned()
            .or_else(|| state.station.clone().filter(|s| s.id == station_id))
            .ok_or_else(|| anyhow::anyhow!("unknown station id '{}'", station_id))?;

        let mut favorites = state.favorites.clone();
        favorites.set(slot, station)?;
        let bytes = favorites.serialize()?;

        self.state_manager
            .modify(|s| s.favorites = favorites)
            .await;
        if let Err(e) = self.store.put(&favorites_key(&state.country), bytes).await {
            warn!("favorites: could not persist: {:#}", e);
        }
        self.notify_state();
        Ok(())
    }

    async fn recall_favorite(&mut self, slot: usize) -> anyhow::Result<()> {
        let state = self.state_manager.get_state().await;
        let saved = state
            .favorites
            .get(slot)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("favorite slot {} is empty", slot))?;

        // Station ids do not survive catalog reloads; match on identity.
        let key = saved.identity_key();
        let station = self
            .catalog
            .stations()
            .iter()
            .find(|s| s.identity_key() == key)
            .cloned()
            .unwrap_or(saved);
        let frequency = station.frequency;
        self.start_load(station, frequency).await;
        Ok(())
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn notify_state(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    /// Broadcast a cleared title if `before` had one.
    fn clear_title(&self, before: &TuningState) {
        if before.now_playing.is_some() {
            let _ = self.broadcast_tx.send(BroadcastMessage::TitleUpdated(None));
        }
    }

    async fn persist_state(&self) {
        if let Err(e) = self.state_manager.save().await {
            warn!("state: could not persist: {:#}", e);
        }
    }
}

fn is_current(state: &TuningState, station: &Station) -> bool {
    state.station.as_ref().map(|s| s.id.as_str()) == Some(station.id.as_str())
}

fn station_name(state: &TuningState) -> &str {
    state.station.as_ref().map(|s| s.name.as_str()).unwrap_or("-")
}

fn favorites_key(country: &str) -> String {
    format!("favorites.{}", country)
}

async fn load_favorites(store: &dyn KeyValueStore, country: &str) -> FavoriteSlots {
    match store.get(&favorites_key(country)).await {
        Ok(Some(bytes)) => FavoriteSlots::deserialize(&bytes),
        Ok(None) => FavoriteSlots::default(),
        Err(e) => {
            warn!("favorites: could not read for {}: {:#}", country, e);
            FavoriteSlots::default()
        }
    }
}
