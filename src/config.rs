//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory. Every
//! field has a default, so a missing file or a partial one is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::render::MonoDownmix;
use crate::constants::*;
use crate::error::{Error, Result};

/// Longest buffering the ring may be sized for
const MAX_SAFETY_MARGIN_SECS: f32 = 60.0;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub producer: ProducerConfig,
    pub buffer: BufferConfig,
    pub playback: PlaybackConfig,
    pub protocol: ProtocolConfig,
    pub events: EventConfig,
}

/// External capture producer process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Path to the producer executable
    pub executable: PathBuf,
    /// Extra command-line arguments
    pub args: Vec<String>,
    /// How long to wait for the producer to exit after `quit` before killing it
    pub shutdown_grace_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_PRODUCER_EXECUTABLE),
            args: Vec::new(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl ProducerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Ring buffer sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Seconds of audio the ring can hold at the active format
    pub safety_margin_secs: f32,
    /// Frames rendered per scratch pass in the audio callback
    pub max_block_frames: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: DEFAULT_SAFETY_MARGIN_SECS,
            max_block_frames: DEFAULT_MAX_BLOCK_FRAMES,
        }
    }
}

/// Audio output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub enabled: bool,
    /// Output device id, default output device when absent
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub mono_downmix: MonoDownmix,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_id: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            mono_downmix: MonoDownmix::default(),
        }
    }
}

/// Wire protocol limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Longest control line accepted before it is discarded
    pub max_line_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// UI-facing event surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Forward raw `pcm-data` chunks to the UI layer
    pub forward_pcm: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { forward_pcm: true }
    }
}

impl AppConfig {
    /// Default location of the config file, if the platform has one
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "process-audio-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults when the file is absent
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let margin = self.buffer.safety_margin_secs;
        if !(margin > 0.0 && margin <= MAX_SAFETY_MARGIN_SECS) {
            return Err(Error::Config(format!(
                "buffer.safety_margin_secs must be in (0, {}], got {}",
                MAX_SAFETY_MARGIN_SECS, margin
            )));
        }
        if self.buffer.max_block_frames == 0 {
            return Err(Error::Config("buffer.max_block_frames must be positive".into()));
        }
        if self.protocol.max_line_bytes == 0 {
            return Err(Error::Config("protocol.max_line_bytes must be positive".into()));
        }
        if self.playback.sample_rate == 0 {
            return Err(Error::Config("playback.sample_rate must be positive".into()));
        }
        Ok(())
    }
}
