use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::default_area_id;

const DEFAULT_STATION_ID: &str = "QRR";
const DEFAULT_VOLUME: f64 = 0.8;

/// What the player remembers between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    #[serde(default = "default_station_id")]
    pub last_station_id: String,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default = "default_area_id")]
    pub area_id: String,
}

fn default_station_id() -> String {
    DEFAULT_STATION_ID.to_string()
}

fn default_volume() -> f64 {
    DEFAULT_VOLUME
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            last_station_id: default_station_id(),
            volume: DEFAULT_VOLUME,
            area_id: default_area_id(),
        }
    }
}

impl PersistentState {
    /// Clamp volume and replace an empty area with the default.
    fn sanitized(mut self) -> Self {
        self.volume = self.volume.clamp(0.0, 1.0);
        if self.area_id.trim().is_empty() {
            self.area_id = default_area_id();
        }
        self
    }
}

/// Owns the persisted record; every mutation is written through to disk.
pub struct StateManager {
    state: Arc<RwLock<PersistentState>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        let persistent = Self::load_persistent(&state_file);
        Self {
            state: Arc::new(RwLock::new(persistent)),
            state_file,
        }
    }

    pub async fn get_state(&self) -> PersistentState {
        self.state.read().await.clone()
    }

    pub async fn set_volume(&self, volume: f64) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
        }
        self.save().await
    }

    pub async fn set_area(&self, area_id: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.area_id = area_id.to_string();
        }
        self.save().await
    }

    /// Record station + volume together after a successful play.
    pub async fn record_playback(&self, station_id: &str, volume: f64) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.last_station_id = station_id.to_string();
            state.volume = volume.clamp(0.0, 1.0);
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = self.state.read().await.clone().sanitized();

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        let content = match std::fs::read_to_string(state_file) {
            Ok(c) => c,
            Err(_) => return PersistentState::default(),
        };
        match serde_json::from_str::<PersistentState>(&content) {
            Ok(persistent) => persistent.sanitized(),
            Err(e) => {
                warn!("Ignoring unreadable state file {}: {}", state_file.display(), e);
                PersistentState::default()
            }
        }
    }
}
