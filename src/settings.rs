use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::capture::CAPTURE_BLOCK_SIZE;
use crate::audio::pcm::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::chat::DEFAULT_CHAT_MODEL;
use crate::live::protocol::{DEFAULT_LIVE_MODEL, DEFAULT_VOICE};

const APP_DIR_NAME: &str = "salesboss-live";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model used for live voice calls.
    pub live_model: String,

    /// Model used for typed chat messages.
    pub chat_model: String,

    /// Prebuilt voice the agent speaks with.
    pub voice: String,

    /// Rate of microphone frames sent to the model.
    pub input_sample_rate: u32,

    /// Rate of speech chunks received from the model (when the chunk doesn't say).
    pub output_sample_rate: u32,

    /// Samples per outbound microphone frame.
    pub capture_block_size: usize,

    /// How long the error status is shown before returning to idle.
    pub error_reset_ms: u64,

    /// Print microphone/speaker level bars while a call is active.
    pub meter_enabled: bool,

    /// Input device name; empty or absent means the system default.
    pub input_device: Option<String>,

    /// Output device name; empty or absent means the system default.
    pub output_device: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            live_model: DEFAULT_LIVE_MODEL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_block_size: CAPTURE_BLOCK_SIZE,
            error_reset_ms: 3000,
            meter_enabled: false,
            input_device: None,
            output_device: None,
        }
    }
}

impl AppSettings {
    pub fn input_device(&self) -> Option<&str> {
        self.input_device.as_deref().filter(|d| !d.is_empty())
    }

    pub fn output_device(&self) -> Option<&str> {
        self.output_device.as_deref().filter(|d| !d.is_empty())
    }
}

/// `<config dir>/salesboss-live/settings.json`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the real one.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
