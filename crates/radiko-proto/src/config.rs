use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub radiko: RadikoConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// HTTP fan-out server settings (`radiko serve`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds a station's transcoder is kept alive after its last listener leaves.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: i64,
    /// A listener that cannot take a chunk within this window is dropped.
    #[serde(default = "default_consumer_write_timeout_ms")]
    pub consumer_write_timeout_ms: u64,
}

/// Upstream pipeline tuning shared by server sessions and the local player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_stall_poll_interval_secs")]
    pub stall_poll_interval_secs: u64,
    /// Chunks buffered between the transcoder reader and the dispatcher.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f64,
    #[serde(default = "default_volume_step")]
    pub volume_step: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

/// Upstream API endpoints and the listening area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadikoConfig {
    #[serde(default = "default_area_id")]
    pub area_id: String,
    #[serde(default = "default_auth_url_base")]
    pub auth_url_base: String,
    /// `{}` is replaced with the station id.
    #[serde(default = "default_stream_xml_url_fmt")]
    pub stream_xml_url_fmt: String,
    /// `{}` is replaced with the area id.
    #[serde(default = "default_station_list_url_fmt")]
    pub station_list_url_fmt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            grace_seconds: default_grace_seconds(),
            consumer_write_timeout_ms: default_consumer_write_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Grace period with the non-positive fallback applied.
    pub fn grace_period(&self) -> Duration {
        if self.grace_seconds <= 0 {
            Duration::from_secs(default_grace_seconds() as u64)
        } else {
            Duration::from_secs(self.grace_seconds as u64)
        }
    }

    pub fn consumer_write_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_write_timeout_ms.max(1))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: default_stall_threshold_secs(),
            stall_poll_interval_secs: default_stall_poll_interval_secs(),
            broadcast_capacity: default_broadcast_capacity(),
            read_chunk_bytes: default_read_chunk_bytes(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl StreamConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs.max(1))
    }

    pub fn stall_poll_interval(&self) -> Duration {
        Duration::from_secs(self.stall_poll_interval_secs.max(1))
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            volume_step: default_volume_step(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

impl Default for RadikoConfig {
    fn default() -> Self {
        Self {
            area_id: default_area_id(),
            auth_url_base: default_auth_url_base(),
            stream_xml_url_fmt: default_stream_xml_url_fmt(),
            station_list_url_fmt: default_station_list_url_fmt(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            recordings_dir: default_recordings_dir(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_grace_seconds() -> i64 {
    10
}

fn default_consumer_write_timeout_ms() -> u64 {
    5000
}

fn default_stall_threshold_secs() -> u64 {
    5
}

fn default_stall_poll_interval_secs() -> u64 {
    2
}

fn default_broadcast_capacity() -> usize {
    100
}

fn default_read_chunk_bytes() -> usize {
    8192
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_volume() -> f64 {
    0.8
}

fn default_volume_step() -> f64 {
    0.05
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_channels() -> u16 {
    2
}

pub fn default_area_id() -> String {
    "JP13".to_string()
}

fn default_auth_url_base() -> String {
    "https://radiko.jp/v2/api".to_string()
}

fn default_stream_xml_url_fmt() -> String {
    "https://radiko.jp/v3/station/stream/pc_html5/{}.xml".to_string()
}

fn default_station_list_url_fmt() -> String {
    "https://api.radiko.jp/program/v3/now/{}.xml".to_string()
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_recordings_dir() -> PathBuf {
    platform::downloads_dir()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, writing defaults there if it is missing.
    pub fn load_from(config_path: &std::path::Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
