//! Persistent CLI settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use parley_core::{CaptureConfig, PlaybackConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CliSettings {
    pub preferred_input_device: Option<String>,
    pub volume: f32,
    pub capture_block_size: usize,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            volume: 1.0,
            capture_block_size: parley_core::config::DEFAULT_CAPTURE_BLOCK_SIZE,
        }
    }
}

impl CliSettings {
    pub fn normalize(&mut self) {
        self.volume = if self.volume.is_nan() {
            1.0
        } else {
            self.volume.clamp(0.0, 1.0)
        };
        if self.capture_block_size == 0 {
            self.capture_block_size = parley_core::config::DEFAULT_CAPTURE_BLOCK_SIZE;
        }
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    /// Apply `PARLEY_INPUT_DEVICE` and `PARLEY_VOLUME` on top of the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var("PARLEY_INPUT_DEVICE").ok(),
            std::env::var("PARLEY_VOLUME").ok(),
        );
    }

    fn apply_overrides(&mut self, input_device: Option<String>, volume: Option<String>) {
        if let Some(device) = input_device {
            self.preferred_input_device = Some(device);
        }
        if let Some(raw) = volume {
            match raw.trim().parse::<f32>() {
                Ok(v) => self.volume = v,
                Err(_) => warn!(value = raw.as_str(), "ignoring unparsable PARLEY_VOLUME"),
            }
        }
        self.normalize();
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            block_size: self.capture_block_size,
            preferred_input_device: self.preferred_input_device.clone(),
            ..CaptureConfig::default()
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            initial_volume: self.volume,
            ..PlaybackConfig::default()
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parley")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> CliSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<CliSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &CliSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
