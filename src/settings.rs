use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audio::CaptureConfig;
use crate::streaming::{Modality, SessionConfig, LIVE_API_URL};

const SETTINGS_DIR_NAME: &str = "live-conversation";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful, witty, and concise AI assistant. You are having a voice conversation with the user.";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to read settings {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse settings {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write settings {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Model identifier sent in the session setup.
    pub model: String,

    /// Prebuilt voice used for synthesized replies.
    pub voice: String,

    /// Persona instruction sent once at session start.
    pub system_instruction: String,

    /// WebSocket endpoint. The API key is appended as a query parameter.
    pub endpoint: String,

    /// Rate of outbound microphone audio.
    pub input_sample_rate: u32,

    /// Rate the playback device is opened at (and assumed for inbound audio
    /// whose mime type carries no rate).
    pub output_sample_rate: u32,

    /// Samples per outbound frame.
    pub frame_size: usize,

    /// RMS multiplier for the 0-100 volume meter.
    pub volume_gain: f32,

    pub connect_timeout_ms: u64,
    pub setup_timeout_ms: u64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            endpoint: LIVE_API_URL.to_string(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 4096,
            volume_gain: 1000.0,
            connect_timeout_ms: 10_000,
            setup_timeout_ms: 10_000,
        }
    }
}

impl LiveSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            response_modality: Modality::Audio,
            voice: self.voice.clone(),
            system_instruction: self.system_instruction.clone(),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            frame_size: self.frame_size,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError {
    let path = path.to_path_buf();
    move |source| SettingsError::Write { path, source }
}

/// Default settings location: `<config dir>/live-conversation/settings.json`
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
        .ok_or(SettingsError::NoConfigDir)
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<LiveSettings, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            serde_json::from_str::<LiveSettings>(&contents).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LiveSettings::default()),
        Err(source) => Err(SettingsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Load settings, falling back to defaults (with a warning) on any error.
pub fn load_settings_or_default(path: &Path) -> LiveSettings {
    load_settings(path).unwrap_or_else(|e| {
        log::warn!("Settings: {}", e);
        LiveSettings::default()
    })
}

pub fn save_settings(path: &Path, settings: &LiveSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_error(parent))?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(write_error(&tmp_path))?;

    // On Windows, rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(write_error(path)(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(write_error(path))?;
    Ok(())
}
