//! Configuration management for tara.
//!
//! This module provides core configuration that doesn't depend on any
//! particular recognition backend or audio host.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::APP_NAME;

/// Download mirrors tried for the local model, in order. Each entry is a base
/// URL the model filename is appended to.
pub const DEFAULT_MODEL_MIRRORS: &[&str] = &[
    "https://huggingface.co/ggerganov/whisper.cpp/resolve/main",
    "https://hf-mirror.com/ggerganov/whisper.cpp/resolve/main",
];

/// Core configuration structure for the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// OpenAI API key. Enables the hosted speech service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_key: Option<String>,

    /// Preferred language for recognition (ISO 639-1 code)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Name of the input device to record from, instead of the system default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,

    /// Local recognition model name, e.g. "tiny.en-q8_0"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Model used by the hosted speech service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_model: Option<String>,

    /// Base URLs the local model is downloaded from, in priority order
    #[serde(
        default = "default_model_mirrors",
        skip_serializing_if = "is_default_model_mirrors"
    )]
    pub model_mirrors: Vec<String>,

    /// Timeout for the existence check against each mirror (seconds)
    #[serde(
        default = "default_probe_timeout",
        skip_serializing_if = "is_default_probe_timeout"
    )]
    pub probe_timeout_secs: u64,

    /// Timeout for downloading and loading the model from one mirror (seconds)
    #[serde(
        default = "default_source_timeout",
        skip_serializing_if = "is_default_source_timeout"
    )]
    pub source_timeout_secs: u64,

    /// Timeout for the whole model acquisition (seconds)
    #[serde(
        default = "default_download_timeout",
        skip_serializing_if = "is_default_download_timeout"
    )]
    pub download_timeout_secs: u64,

    /// Listening session timeout (seconds)
    #[serde(
        default = "default_session_timeout",
        skip_serializing_if = "is_default_session_timeout"
    )]
    pub session_timeout_secs: u64,

    /// Interval between revealed words of a simulated transcription (ms)
    #[serde(
        default = "default_simulation_tick",
        skip_serializing_if = "is_default_simulation_tick"
    )]
    pub simulation_tick_ms: u64,

    /// Pause before a simulated transcription is finalized (ms)
    #[serde(
        default = "default_simulation_pause",
        skip_serializing_if = "is_default_simulation_pause"
    )]
    pub simulation_pause_ms: u64,

    /// Endpoint model load failures are reported to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics_endpoint: Option<String>,
}

fn default_model_mirrors() -> Vec<String> {
    DEFAULT_MODEL_MIRRORS.iter().map(|m| m.to_string()).collect()
}

fn is_default_model_mirrors(v: &[String]) -> bool {
    v.iter().map(String::as_str).eq(DEFAULT_MODEL_MIRRORS.iter().copied())
}

fn default_probe_timeout() -> u64 {
    5
}

fn is_default_probe_timeout(v: &u64) -> bool {
    *v == default_probe_timeout()
}

fn default_source_timeout() -> u64 {
    30
}

fn is_default_source_timeout(v: &u64) -> bool {
    *v == default_source_timeout()
}

fn default_download_timeout() -> u64 {
    60
}

fn is_default_download_timeout(v: &u64) -> bool {
    *v == default_download_timeout()
}

fn default_session_timeout() -> u64 {
    10
}

fn is_default_session_timeout(v: &u64) -> bool {
    *v == default_session_timeout()
}

fn default_simulation_tick() -> u64 {
    400
}

fn is_default_simulation_tick(v: &u64) -> bool {
    *v == default_simulation_tick()
}

fn default_simulation_pause() -> u64 {
    800
}

fn is_default_simulation_pause(v: &u64) -> bool {
    *v == default_simulation_pause()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_key: None,
            language: None,
            input_device: None,
            model: None,
            service_model: None,
            model_mirrors: default_model_mirrors(),
            probe_timeout_secs: default_probe_timeout(),
            source_timeout_secs: default_source_timeout(),
            download_timeout_secs: default_download_timeout(),
            session_timeout_secs: default_session_timeout(),
            simulation_tick_ms: default_simulation_tick(),
            simulation_pause_ms: default_simulation_pause(),
            diagnostics_endpoint: None,
        }
    }
}

impl Config {
    /// Get the OpenAI API key
    pub fn key_openai(&self) -> Option<&str> {
        self.openai_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// Get the preferred language
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn input_device(&self) -> Option<&str> {
        self.input_device.as_deref()
    }

    /// Get the local model name
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Get the hosted service model name
    pub fn service_model(&self) -> Option<&str> {
        self.service_model.as_deref()
    }

    pub fn model_mirrors(&self) -> &[String] {
        &self.model_mirrors
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn simulation_tick(&self) -> Duration {
        Duration::from_millis(self.simulation_tick_ms)
    }

    pub fn simulation_pause(&self) -> Duration {
        Duration::from_millis(self.simulation_pause_ms)
    }

    pub fn diagnostics_endpoint(&self) -> Option<&str> {
        self.diagnostics_endpoint.as_deref()
    }
}

/// Manages loading and saving configuration files.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager with the default configuration directory.
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Ok(Self { config_path })
    }

    /// Creates a new ConfigManager with a specified configuration directory.
    pub fn with_config_dir<P: AsRef<std::path::Path>>(dir: P) -> Self {
        let config_path = dir.as_ref().join(format!("{}.toml", APP_NAME));
        Self { config_path }
    }

    /// Returns the default path to the configuration file.
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to retrieve configuration directory")?;
        Ok(config_dir.join(APP_NAME).join(format!("{}.toml", APP_NAME)))
    }

    /// Loads the configuration from the config file or returns default.
    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config file at {:?}", self.config_path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file at {:?}", self.config_path))?;

        if config.key_openai().is_none() {
            warn!(
                "OpenAI API key is not set. The hosted speech service is disabled; \
                 voice input uses the local model or simulation."
            );
        }

        if config.model_mirrors().is_empty() {
            warn!("No model mirrors configured. The local model can only be loaded from cache.");
        }

        Ok(config)
    }

    /// Saves the configuration to the config file.
    pub fn save(&self, config: &Config) -> Result<()> {
        let config_dir = self
            .config_path
            .parent()
            .with_context(|| format!("Failed to get parent directory of {:?}", self.config_path))?;

        fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory at {:?}", config_dir))?;

        let serialized =
            toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, serialized)
            .with_context(|| format!("Failed to write config file at {:?}", self.config_path))?;

        Ok(())
    }

    /// Returns the path to the configuration file.
    pub fn config_path(&self) -> &std::path::Path {
        &self.config_path
    }
}
