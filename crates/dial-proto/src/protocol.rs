use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::favorites::FavoriteSlots;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lower edge of the simulated FM band (MHz).
pub const FREQ_MIN: f64 = 88.0;
/// Upper edge of the simulated FM band (MHz).
pub const FREQ_MAX: f64 = 108.0;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Move the dial to an absolute frequency.
    Tune { frequency: f64 },
    /// Nudge the dial by `delta` MHz.
    Step { delta: f64 },
    NextStation,
    PrevStation,
    SelectStation { id: String },
    TogglePlayPause,
    Volume { value: f32 },
    /// `None` shows every station.
    SelectGenre { genre: Option<Genre> },
    SetCountry { code: String },
    SaveFavorite { slot: usize, station_id: String },
    RecallFavorite { slot: usize },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: TuningState,
    },
    State {
        data: TuningState,
    },
    /// Now-playing title changed (None = cleared).
    Title {
        title: Option<String>,
    },
    Log {
        message: String,
    },
}

/// Genre tag attached to a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Genre {
    Music,
    Pop,
    Rock,
    Jazz,
    Classical,
    News,
    Sports,
    Education,
}

impl Genre {
    pub const ALL: [Genre; 8] = [
        Genre::Music,
        Genre::Pop,
        Genre::Rock,
        Genre::Jazz,
        Genre::Classical,
        Genre::News,
        Genre::Sports,
        Genre::Education,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Genre::Music => "music",
            Genre::Pop => "pop",
            Genre::Rock => "rock",
            Genre::Jazz => "jazz",
            Genre::Classical => "classical",
            Genre::News => "news",
            Genre::Sports => "sports",
            Genre::Education => "education",
        }
    }

    /// Tags matched when filtering by this genre.  "music" is a composite
    /// that also covers the individual music styles.
    pub fn expand(self) -> &'static [Genre] {
        match self {
            Genre::Music => &[
                Genre::Music,
                Genre::Pop,
                Genre::Rock,
                Genre::Jazz,
                Genre::Classical,
            ],
            Genre::Pop => &[Genre::Pop],
            Genre::Rock => &[Genre::Rock],
            Genre::Jazz => &[Genre::Jazz],
            Genre::Classical => &[Genre::Classical],
            Genre::News => &[Genre::News],
            Genre::Sports => &[Genre::Sports],
            Genre::Education => &[Genre::Education],
        }
    }

    /// Map a free-text directory tag string onto a single genre.
    /// Rules are checked in order; the first substring hit wins.
    pub fn from_tags(tags: &str) -> Genre {
        const RULES: &[(&[&str], Genre)] = &[
            (&["news", "talk"], Genre::News),
            (&["pop", "top40", "top 40"], Genre::Pop),
            (&["rock", "alternative"], Genre::Rock),
            (&["jazz"], Genre::Jazz),
            (&["classical"], Genre::Classical),
            (&["sport"], Genre::Sports),
            (&["education", "public"], Genre::Education),
        ];

        let tags = tags.to_ascii_lowercase();
        RULES
            .iter()
            .find(|(needles, _)| needles.iter().any(|n| tags.contains(n)))
            .map(|(_, genre)| *genre)
            .unwrap_or(Genre::Music)
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Genre {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Genre::ALL
            .iter()
            .find(|g| g.label().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown genre '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    /// Opaque id, unique within one catalog load.
    pub id: String,
    pub name: String,
    /// Declared dial position in MHz.
    pub frequency: f64,
    pub url: String,
    #[serde(default)]
    pub genre: Option<Genre>,
    #[serde(default)]
    pub sub_genre: Option<String>,
}

impl Station {
    /// Identity that survives catalog reloads (ids do not).
    pub fn identity_key(&self) -> String {
        format!("{}@{:.2}", self.name, self.frequency)
    }

    /// True when this station carries any of the given tags.
    pub fn matches_genre(&self, genre: Genre) -> bool {
        let tags = genre.expand();
        self.genre.map(|g| tags.contains(&g)).unwrap_or(false)
            || self
                .sub_genre
                .as_deref()
                .and_then(|s| s.parse::<Genre>().ok())
                .map(|g| tags.contains(&g))
                .unwrap_or(false)
    }
}

/// Playback phase of the tuning state machine.
///
/// Transitions:
///   Idle -> Resolving -> Loading -> Playing
///   Loading -> Failed | Idle (timeout)
///   Playing -> Idle (paused) | Failed (stream dropped)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Resolving,
    Loading,
    Playing,
    Failed,
}

/// Why the last load attempt stopped without playing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "reason")]
pub enum Failure {
    /// No ready/failed signal arrived within the load timeout.
    Timeout,
    /// The session reported an explicit failure.
    Error(String),
}

/// Everything a client needs to render the dial.  `rev` is a monotonically
/// increasing counter incremented on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningState {
    #[serde(default)]
    pub rev: u64,
    pub frequency: f64,
    pub station: Option<Station>,
    pub phase: PlaybackPhase,
    pub now_playing: Option<String>,
    pub last_load_ms: Option<u64>,
    #[serde(default)]
    pub failure: Option<Failure>,
    pub volume: f32,
    pub country: String,
    pub genre: Option<Genre>,
    #[serde(default)]
    pub visible: Vec<Station>,
    #[serde(default)]
    pub fastest: Vec<Station>,
    #[serde(default)]
    pub favorites: FavoriteSlots,
}

impl Default for TuningState {
    fn default() -> Self {
        Self {
            rev: 0,
            frequency: FREQ_MIN,
            station: None,
            phase: PlaybackPhase::Idle,
            now_playing: None,
            last_load_ms: None,
            failure: None,
            volume: 0.5,
            country: String::new(),
            genre: None,
            visible: Vec::new(),
            fastest: Vec::new(),
            favorites: FavoriteSlots::default(),
        }
    }
}

impl TuningState {
    pub fn is_playing(&self) -> bool {
        self.phase == PlaybackPhase::Playing
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, PlaybackPhase::Resolving | PlaybackPhase::Loading)
    }
}

/// Clamp a requested dial position onto the band.
pub fn clamp_frequency(frequency: f64) -> f64 {
    if frequency.is_nan() {
        return FREQ_MIN;
    }
    frequency.clamp(FREQ_MIN, FREQ_MAX)
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
