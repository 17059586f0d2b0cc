//! Speech recognition backends for tara.
//!
//! This crate provides trait-based abstractions for the two recognizer
//! families a listening session can use:
//!
//! - [`StreamingRecognizer`]: a local model fed frame by frame (the `model`
//!   strategy), built by a [`RecognizerFactory`] once the model is loaded.
//! - [`SpeechService`]: a hosted service that turns frames into result sets
//!   with interim and final entries (the `native` strategy).
//!
//! It also owns model provisioning: the model catalogue, HTTP download and
//! the mirror racing procedure with per-source and global timeouts.

mod mirrors;
mod model;
mod native;
mod openai;
mod text;

#[cfg(feature = "local-whisper")]
mod whisper;

use std::sync::Arc;

use async_trait::async_trait;
pub use mirrors::{
    Fetched, LoadErrorClass, MirrorFailure, MirrorPolicy, ModelLoadError, ModelSource,
    ProgressFn, SourceFetcher, fetch_from_mirrors, prioritize, probe_sources, race_with_timeout,
};
pub use model::{HttpModelFetcher, WhisperModel, verify_model};
pub use native::{
    HostedRecognition, HostedSpeechService, NativeUpdate, RecognitionHandle, ResultSet,
    SpeechResult, SpeechService,
};
pub use openai::{OpenAIClient, OpenAIConfig, decode_transcription};
use tara_core::RecognitionEvent;
pub use text::strip_non_speech;
use thiserror::Error;
#[cfg(feature = "local-whisper")]
pub use whisper::{WhisperModelLoader, WhisperRecognizer, WhisperRecognizerFactory};

/// Errors that can occur during recognition.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("No API key configured")]
    NoApiKey,

    #[error("Invalid audio format: {0}")]
    InvalidAudioFormat(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Malformed recognizer response: {0}")]
    MalformedResponse(String),

    #[error("Recognition failed: {0}")]
    RecognitionFailed(String),
}

/// Result type for recognition operations.
pub type Result<T> = std::result::Result<T, RecognitionError>;

/// Trait for one-shot transcription backends.
///
/// Used by [`HostedSpeechService`] to turn buffered utterance audio into
/// text. Implement this trait to put another hosted provider behind the
/// native strategy.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV encoded audio to text.
    ///
    /// # Arguments
    /// * `audio` - WAV file bytes
    /// * `language` - Optional language hint (ISO 639-1 code, e.g., "en")
    async fn transcribe(&self, audio: &[u8], language: Option<&str>) -> Result<String>;

    /// Returns the name of this transcriber for logging/debugging.
    fn name(&self) -> &str;
}

/// A local recognizer consuming 16 kHz mono frames.
///
/// Decoding is CPU bound. Implementations run it on the blocking pool so a
/// pending call never holds up the async threads.
#[async_trait]
pub trait StreamingRecognizer: Send {
    /// Feeds one frame. Returns an event when the frame produced a new
    /// partial or a final result for the current utterance.
    ///
    /// Dropping the returned future keeps the frame but may skip the decode
    /// it triggered.
    async fn accept(&mut self, frame: &[f32]) -> Result<Option<RecognitionEvent>>;

    /// Best-effort transcription of whatever has been heard so far.
    async fn flush(&mut self) -> Option<String>;

    fn name(&self) -> &str;
}

/// Creates recognizers from a loaded model. Cheap to call per session.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self, language: Option<&str>) -> Result<Box<dyn StreamingRecognizer>>;

    fn name(&self) -> &str;
}

/// Provides the local model to the capability prober.
///
/// A loader is a [`SourceFetcher`] whose output is a ready recognizer
/// factory, plus a cache lookup that avoids the network entirely.
#[async_trait]
pub trait ModelLoader: SourceFetcher<Arc<dyn RecognizerFactory>> {
    /// Candidate download sources in configured order.
    fn sources(&self) -> Vec<ModelSource>;

    /// Loads the model from the local cache, if a verified copy exists.
    async fn load_cached(&self) -> Option<Arc<dyn RecognizerFactory>>;
}
