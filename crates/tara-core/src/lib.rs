//! Core types and configuration for tara.
//!
//! This crate provides platform-agnostic types that can be used across
//! all tara sub-crates: capability and strategy selection, recognition
//! events, session phases and the user configuration.

mod capability;
mod config;
mod event;
mod state;
mod strategy;

use std::path::PathBuf;

use anyhow::{Context, Result};

pub use capability::Capability;
pub use config::{Config, ConfigManager, DEFAULT_MODEL_MIRRORS};
pub use event::{RecognitionEvent, ResultKind, Transcript, VoiceEvent};
pub use state::SessionPhase;
pub use strategy::{Strategy, select_strategy};

/// Application name
pub const APP_NAME: &str = "tara";

/// Pretty application name for display
pub const APP_NAME_PRETTY: &str = "Tara";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Returns the directory downloaded recognition models are cached in.
pub fn models_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Failed to retrieve data directory")?;
    Ok(data_dir.join(APP_NAME).join("models"))
}
