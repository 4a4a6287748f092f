//! Station directory per country.
//!
//! Sources, in priority order:
//!   1. a local TOML station file (`[[station]]` tables),
//!   2. the JSON station directory (radio-browser layout) for the country,
//!   3. a fixed built-in list, so a catalog is never empty.
//!
//! Directory entries get synthetic dial positions spread evenly over
//! [88.0, 108.0) in fetch order.  Results are cached per country code for the
//! lifetime of the directory; only a successful load is cached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dial_proto::config::Config;
use dial_proto::protocol::{Genre, Station, FREQ_MAX, FREQ_MIN};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Float slack so a 0.1 tolerance still matches 92.5 against 92.4.
const FREQ_EPSILON: f64 = 1e-9;

/// Ordered, immutable station list for one country.
#[derive(Debug, Clone, PartialEq)]
pub struct StationCatalog {
    pub country: String,
    stations: Vec<Station>,
}

impl StationCatalog {
    pub fn new(country: impl Into<String>, stations: Vec<Station>) -> Self {
        Self {
            country: country.into(),
            stations,
        }
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.id == id)
    }

    pub fn find_by_frequency(&self, frequency: f64, tolerance: f64) -> Option<&Station> {
        find_by_frequency(&self.stations, frequency, tolerance)
    }

    /// `None` keeps everything.  "music" also matches pop, rock, jazz and
    /// classical.
    pub fn filter(&self, genre: Option<Genre>) -> Vec<Station> {
        match genre {
            None => self.stations.clone(),
            Some(genre) => self
                .stations
                .iter()
                .filter(|s| s.matches_genre(genre))
                .cloned()
                .collect(),
        }
    }
}

/// Nearest entry within `tolerance`; ties go to the earlier entry.
pub fn find_by_frequency(stations: &[Station], frequency: f64, tolerance: f64) -> Option<&Station> {
    let mut best: Option<(f64, &Station)> = None;
    for station in stations {
        let distance = (station.frequency - frequency).abs();
        if distance > tolerance + FREQ_EPSILON {
            continue;
        }
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, station));
        }
    }
    best.map(|(_, s)| s)
}

/// Next (or previous) station by declared frequency, wrapping around the band.
pub fn neighbour(stations: &[Station], frequency: f64, forward: bool) -> Option<&Station> {
    let mut sorted: Vec<&Station> = stations.iter().collect();
    sorted.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));

    if forward {
        sorted
            .iter()
            .find(|s| s.frequency > frequency + FREQ_EPSILON)
            .or_else(|| sorted.first())
            .copied()
    } else {
        sorted
            .iter()
            .rev()
            .find(|s| s.frequency < frequency - FREQ_EPSILON)
            .or_else(|| sorted.last())
            .copied()
    }
}

/// Loads and caches catalogs by country code.
pub struct StationDirectory {
    client: reqwest::Client,
    directory_url: String,
    stations_toml: PathBuf,
    max_stations: usize,
    catalogs: RwLock<HashMap<String, Arc<StationCatalog>>>,
}

impl StationDirectory {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fmdial/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.playback.connect_timeout_secs))
            .timeout(Duration::from_secs(20))
            .build()?;

        Ok(Self {
            client,
            directory_url: config.catalog.directory_url.clone(),
            stations_toml: config.catalog.stations_toml.clone(),
            max_stations: config.catalog.max_stations,
            catalogs: RwLock::new(HashMap::new()),
        })
    }

    /// Never fails and never returns an empty catalog.
    pub async fn load(&self, country: &str) -> Arc<StationCatalog> {
        let country = country.trim().to_ascii_uppercase();

        if let Some(cached) = self.catalogs.read().await.get(&country) {
            debug!("catalog: reusing cached list for {}", country);
            return Arc::clone(cached);
        }

        match self.load_uncached(&country).await {
            Ok(stations) if !stations.is_empty() => {
                info!("catalog: {} stations for {}", stations.len(), country);
                let catalog = Arc::new(StationCatalog::new(country.clone(), stations));
                self.catalogs
                    .write()
                    .await
                    .insert(country, Arc::clone(&catalog));
                catalog
            }
            Ok(_) => {
                warn!("catalog: no stations for {}, using built-in list", country);
                Arc::new(StationCatalog::new(country, fallback_stations()))
            }
            Err(e) => {
                warn!("catalog: load failed for {} ({:#}), using built-in list", country, e);
                Arc::new(StationCatalog::new(country, fallback_stations()))
            }
        }
    }

    /// Seed the cache for `catalog.country`, replacing any earlier list.
    pub async fn preload(&self, catalog: StationCatalog) -> Arc<StationCatalog> {
        let country = catalog.country.trim().to_ascii_uppercase();
        let catalog = Arc::new(StationCatalog::new(country.clone(), catalog.stations));
        self.catalogs
            .write()
            .await
            .insert(country, Arc::clone(&catalog));
        catalog
    }

    async fn load_uncached(&self, country: &str) -> anyhow::Result<Vec<Station>> {
        if self.stations_toml.exists() {
            let stations = load_stations_from_toml(&self.stations_toml, country)?;
            if !stations.is_empty() {
                debug!("catalog: using {:?}", self.stations_toml);
                return Ok(stations);
            }
        }
        self.fetch(country).await
    }

    async fn fetch(&self, country: &str) -> anyhow::Result<Vec<Station>> {
        let url = self.directory_url.replace("{country}", country);
        info!("catalog: fetching {}", url);
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let mut stations = parse_directory_json(&body, country)?;
        stations.truncate(self.max_stations);
        assign_frequencies(&mut stations);
        Ok(stations)
    }
}

// ── directory JSON ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DirectoryRecord {
    #[serde(default)]
    stationuuid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    url_resolved: String,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    votes: i64,
}

/// Directory records in fetch order.  Frequencies are left at 0 until
/// `assign_frequencies` runs on the final (truncated) list.
pub fn parse_directory_json(body: &[u8], country: &str) -> anyhow::Result<Vec<Station>> {
    let records: Vec<DirectoryRecord> = serde_json::from_slice(body)?;
    let stations = records
        .into_iter()
        .enumerate()
        .filter_map(|(i, rec)| {
            let name = rec.name.trim().to_string();
            let url = if rec.url_resolved.trim().is_empty() {
                rec.url.trim().to_string()
            } else {
                rec.url_resolved.trim().to_string()
            };
            if name.is_empty() || url.is_empty() {
                return None;
            }
            let id = if rec.stationuuid.is_empty() {
                format!("{}-{}", country.to_ascii_lowercase(), i)
            } else {
                rec.stationuuid
            };
            let genre = Genre::from_tags(&rec.tags);
            let sub_genre = rec
                .tags
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .find(|t| !t.is_empty() && t != genre.label());
            debug!("catalog: {} ({} votes) → {}", name, rec.votes, genre);
            Some(Station {
                id,
                name,
                frequency: 0.0,
                url,
                genre: Some(genre),
                sub_genre,
            })
        })
        .collect();
    Ok(stations)
}

/// Spread stations evenly over [88.0, 108.0) in list order.
pub fn assign_frequencies(stations: &mut [Station]) {
    if stations.is_empty() {
        return;
    }
    let step = (FREQ_MAX - FREQ_MIN) / stations.len() as f64;
    for (i, station) in stations.iter_mut().enumerate() {
        station.frequency = FREQ_MIN + step * i as f64;
    }
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// Kept separate from `Station` so the file schema can diverge from the wire
/// struct without breaking either.
#[derive(Debug, Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, Deserialize)]
struct TomlStation {
    name: String,
    url: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    frequency: Option<f64>,
    #[serde(default)]
    genre: Option<String>,
    #[serde(default)]
    sub_genre: Option<String>,
    /// Empty matches every country.
    #[serde(default)]
    country: String,
}

pub fn load_stations_from_toml(path: &Path, country: &str) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content, country)
}

/// Entries without a frequency are spread evenly like directory entries;
/// declared frequencies are kept as-is.
pub fn parse_stations_from_toml_str(content: &str, country: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let entries: Vec<TomlStation> = file
        .station
        .into_iter()
        .filter(|s| s.country.is_empty() || s.country.eq_ignore_ascii_case(country))
        .collect();

    let step = (FREQ_MAX - FREQ_MIN) / entries.len().max(1) as f64;
    let stations = entries
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let genre = match s.genre.as_deref() {
                Some(tag) => Some(tag.parse::<Genre>().unwrap_or_else(|_| Genre::from_tags(tag))),
                None => None,
            };
            Station {
                id: s
                    .id
                    .unwrap_or_else(|| format!("{}-{}", country.to_ascii_lowercase(), i)),
                name: s.name,
                frequency: s
                    .frequency
                    .unwrap_or(FREQ_MIN + step * i as f64)
                    .clamp(FREQ_MIN, FREQ_MAX),
                url: s.url,
                genre,
                sub_genre: s.sub_genre,
            }
        })
        .collect();
    Ok(stations)
}

// ── built-in fallback ─────────────────────────────────────────────────────────

pub fn fallback_stations() -> Vec<Station> {
    const BUILTIN: &[(&str, &str, f64, &str, Genre)] = &[
        ("builtin-groove", "SomaFM Groove Salad", 88.5, "https://ice1.somafm.com/groovesalad-128-mp3", Genre::Music),
        ("builtin-bbcws", "BBC World Service", 91.3, "http://stream.live.vc.bbcmedia.co.uk/bbc_world_service", Genre::News),
        ("builtin-kexp", "KEXP", 93.7, "https://kexp-mp3-128.streamguys1.com/kexp128.mp3", Genre::Rock),
        ("builtin-jazz24", "Jazz24", 96.1, "https://live.wostreaming.net/direct/ppm-jazz24mp3-ibc1", Genre::Jazz),
        ("builtin-paradise", "Radio Paradise", 98.9, "https://stream.radioparadise.com/mp3-128", Genre::Rock),
        ("builtin-indiepop", "SomaFM Indie Pop Rocks", 101.5, "https://ice1.somafm.com/indiepop-128-mp3", Genre::Pop),
        ("builtin-venice", "Venice Classic Radio", 103.3, "https://uk2.streamingpulse.com/ssl/vcr1", Genre::Classical),
        ("builtin-dronezone", "SomaFM Drone Zone", 106.7, "https://ice1.somafm.com/dronezone-128-mp3", Genre::Music),
    ];

    BUILTIN
        .iter()
        .map(|(id, name, frequency, url, genre)| Station {
            id: id.to_string(),
            name: name.to_string(),
            frequency: *frequency,
            url: url.to_string(),
            genre: Some(*genre),
            sub_genre: None,
        })
        .collect()
}
