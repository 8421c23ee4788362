//! CLI configuration file

use anyhow::{Context, Result};
use duet_core::media::{MediaSessionManager, SimulatedMediaConfig, SimulatedMediaManager};
use duet_core::{CallManagerConfig, RtcMediaConfig, RtcMediaManager};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default relay address for `duet relay` and clients
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9470";

/// Contents of `--config <file.json>`; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuetConfig {
    /// Identity to register as
    pub identity: Option<String>,
    /// Relay WebSocket URL
    pub relay_url: Option<String>,
    /// JSON-lines history file
    pub history_path: Option<PathBuf>,
    /// Call state machine settings
    pub call: CallManagerConfig,
    /// Media backend for `call` and `listen`
    pub media: MediaBackend,
}

/// Which media backend endpoints use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum MediaBackend {
    /// webrtc-rs peer connections
    Webrtc(RtcMediaConfig),
    /// Device-free simulation
    Simulated(SimulatedMediaConfig),
}

impl Default for MediaBackend {
    fn default() -> Self {
        Self::Webrtc(RtcMediaConfig::default())
    }
}

impl MediaBackend {
    pub fn build(&self) -> Result<Arc<dyn MediaSessionManager>> {
        Ok(match self {
            Self::Webrtc(config) => Arc::new(RtcMediaManager::new(config.clone())?),
            Self::Simulated(config) => Arc::new(SimulatedMediaManager::new(config.clone())),
        })
    }
}

impl DuetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// `<data dir>/history.jsonl`, or the working directory if none exists
pub fn default_history_path() -> PathBuf {
    directories::ProjectDirs::from("org", "duet", "duet")
        .map(|dirs| dirs.data_dir().join("history.jsonl"))
        .unwrap_or_else(|| PathBuf::from("duet-history.jsonl"))
}
