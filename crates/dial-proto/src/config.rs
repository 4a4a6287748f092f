use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding one file per favorites key.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Last country and volume.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

/// TCP control socket for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Spawn mpv for audible playback.
    Mpv,
    /// Discard audio; metadata and load statistics only.
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
    /// Seconds to wait for a ready/failed signal before giving up.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    /// Audio bytes that must reach the engine before a stream counts as ready.
    #[serde(default = "default_prebuffer_bytes")]
    pub prebuffer_bytes: usize,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Station directory source: a JSON directory URL or a local TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_country")]
    pub country: String,
    /// `{country}` is replaced by the upper-case country code.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    /// Local TOML station file; used instead of the directory when present.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    #[serde(default = "default_max_stations")]
    pub max_stations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Match window for dial moves (MHz).
    #[serde(default = "default_dial_tolerance")]
    pub dial_tolerance: f64,
    /// Match window when re-syncing after a country switch (MHz).
    #[serde(default = "default_resync_tolerance")]
    pub resync_tolerance: f64,
    #[serde(default = "default_shortlist_size")]
    pub shortlist_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            state_file: default_state_file(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            load_timeout_secs: default_load_timeout_secs(),
            prebuffer_bytes: default_prebuffer_bytes(),
            default_volume: default_volume(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            country: default_country(),
            directory_url: default_directory_url(),
            stations_toml: default_stations_toml(),
            max_stations: default_max_stations(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            dial_tolerance: default_dial_tolerance(),
            resync_tolerance: default_resync_tolerance(),
            shortlist_size: default_shortlist_size(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    platform::data_dir().join("store")
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_engine() -> EngineKind {
    EngineKind::Mpv
}

fn default_load_timeout_secs() -> u64 {
    10
}

fn default_prebuffer_bytes() -> usize {
    16 * 1024
}

fn default_volume() -> f32 {
    0.5
}

fn default_connect_timeout_secs() -> u64 {
    8
}

fn default_country() -> String {
    "US".to_string()
}

fn default_directory_url() -> String {
    "https://de1.api.radio-browser.info/json/stations/bycountrycodeexact/{country}?hidebroken=true&order=votes&reverse=true"
        .to_string()
}

fn default_stations_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

fn default_max_stations() -> usize {
    100
}

fn default_max_age_secs() -> u64 {
    60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_dial_tolerance() -> f64 {
    0.1
}

fn default_resync_tolerance() -> f64 {
    2.0
}

fn default_shortlist_size() -> usize {
    9
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Directory URL for one country.
    pub fn directory_url_for(&self, country: &str) -> String {
        self.catalog
            .directory_url
            .replace("{country}", &country.to_ascii_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.control.enabled);
        assert_eq!(config.control.port, 9877);
        assert_eq!(config.playback.load_timeout_secs, 10);
        assert_eq!(config.cache.max_age_secs, 3600);
        assert_eq!(config.cache.sweep_interval_secs, 300);
        assert_eq!(config.tuning.dial_tolerance, 0.1);
        assert_eq!(config.tuning.resync_tolerance, 2.0);
        assert_eq!(config.tuning.shortlist_size, 9);
        assert!(config.catalog.stations_toml.ends_with("fmdial/stations.toml"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [playback]
            engine = "null"
            prebuffer_bytes = 1

            [catalog]
            country = "nl"
            "#,
        )
        .unwrap();
        assert_eq!(config.playback.engine, EngineKind::Null);
        assert_eq!(config.playback.prebuffer_bytes, 1);
        assert_eq!(config.playback.load_timeout_secs, 10);
        assert_eq!(config.catalog.country, "nl");
        assert!(config.directory_url_for("nl").contains("/NL?"));
    }
}
