//! Local Whisper recognition using whisper-rs.
//!
//! Frames are cut into utterances by loudness. The utterance heard so far is
//! decoded at every interim interval for a partial result, and once more when
//! trailing silence ends it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tara_audio::{DetectorConfig, Segment, UtteranceDetector};
use tara_core::{RecognitionEvent, ResultKind};
use tracing::{debug, info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::mirrors::{ModelLoadError, ModelSource, ProgressFn, SourceFetcher};
use crate::model::HttpModelFetcher;
use crate::{
    ModelLoader, RecognitionError, RecognizerFactory, Result, StreamingRecognizer, strip_non_speech,
};

/// A loaded Whisper model. Creates one recognizer per session.
pub struct WhisperRecognizerFactory {
    context: Arc<WhisperContext>,
    detector: DetectorConfig,
}

impl WhisperRecognizerFactory {
    /// Loads a model file. Blocking; run it off the async threads.
    pub fn load(path: &Path) -> std::result::Result<Self, ModelLoadError> {
        info!(path = ?path, "Loading Whisper model");

        let path_str = path
            .to_str()
            .ok_or_else(|| ModelLoadError::Io(format!("invalid model path {:?}", path)))?;
        let context = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| ModelLoadError::Unknown(format!("failed to load model: {}", e)))?;

        info!("Whisper model loaded successfully");
        Ok(Self {
            context: Arc::new(context),
            detector: DetectorConfig::default(),
        })
    }
}

impl RecognizerFactory for WhisperRecognizerFactory {
    fn create(&self, language: Option<&str>) -> Result<Box<dyn StreamingRecognizer>> {
        Ok(Box::new(WhisperRecognizer {
            context: self.context.clone(),
            language: language.map(str::to_string),
            detector: UtteranceDetector::new(self.detector),
            buffer: Vec::new(),
        }))
    }

    fn name(&self) -> &str {
        "local-whisper"
    }
}

pub struct WhisperRecognizer {
    context: Arc<WhisperContext>,
    language: Option<String>,
    detector: UtteranceDetector,
    buffer: Vec<f32>,
}

impl WhisperRecognizer {
    /// Decodes the utterance heard so far on the blocking pool.
    async fn decode(&self) -> Result<String> {
        let context = self.context.clone();
        let language = self.language.clone();
        let samples = self.buffer.clone();
        tokio::task::spawn_blocking(move || decode_samples(&context, language.as_deref(), &samples))
            .await
            .map_err(|e| RecognitionError::RecognitionFailed(format!("Decode task failed: {}", e)))?
    }
}

fn decode_samples(context: &WhisperContext, language: Option<&str>, samples: &[f32]) -> Result<String> {
    let mut state = context.create_state().map_err(|e| {
        RecognitionError::RecognitionFailed(format!("Failed to create state: {}", e))
    })?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_language(language);

    // Disable printing to stdout
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    state.full(params, samples).map_err(|e| {
        RecognitionError::RecognitionFailed(format!("Transcription failed: {}", e))
    })?;

    let num_segments = state.full_n_segments().map_err(|e| {
        RecognitionError::RecognitionFailed(format!("Failed to get segments: {}", e))
    })?;

    let mut text = String::new();
    for i in 0..num_segments {
        let segment = state.full_get_segment_text(i).map_err(|e| {
            RecognitionError::MalformedResponse(format!("Failed to get segment {}: {}", i, e))
        })?;
        text.push_str(&segment);
        text.push(' ');
    }

    debug!(samples = samples.len(), "Decoded utterance");
    Ok(strip_non_speech(&text))
}

/// Turns a decode into an event of `kind`; undecodable output is reported
/// as malformed rather than failing the recognizer.
fn classify(decoded: Result<String>, kind: ResultKind) -> Result<Option<RecognitionEvent>> {
    match decoded {
        Ok(text) if text.is_empty() => {
            debug!(kind = ?kind, "Decoded no speech");
            Ok(None)
        }
        Ok(text) => Ok(Some(match kind {
            ResultKind::Partial => RecognitionEvent::Partial(text),
            ResultKind::Final => RecognitionEvent::Final(text),
        })),
        Err(RecognitionError::MalformedResponse(e)) => {
            warn!(kind = ?kind, error = %e, "Malformed segment text");
            Ok(Some(RecognitionEvent::Malformed(kind)))
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl StreamingRecognizer for WhisperRecognizer {
    async fn accept(&mut self, frame: &[f32]) -> Result<Option<RecognitionEvent>> {
        match self.detector.push(frame) {
            Segment::Silence => {
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                Ok(None)
            }
            Segment::Speech => {
                self.buffer.extend_from_slice(frame);
                Ok(None)
            }
            Segment::Interim => {
                self.buffer.extend_from_slice(frame);
                classify(self.decode().await, ResultKind::Partial)
            }
            Segment::EndOfUtterance => {
                self.buffer.extend_from_slice(frame);
                let event = classify(self.decode().await, ResultKind::Final);
                self.buffer.clear();
                event
            }
        }
    }

    async fn flush(&mut self) -> Option<String> {
        if !self.detector.heard_speech() {
            return None;
        }
        let text = match self.decode().await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to decode pending audio");
                return None;
            }
        };
        self.buffer.clear();
        self.detector.reset();
        Some(text).filter(|t| !t.is_empty())
    }

    fn name(&self) -> &str {
        "local-whisper"
    }
}

/// Provides the Whisper model from the cache or the configured mirrors.
pub struct WhisperModelLoader {
    fetcher: HttpModelFetcher,
    mirrors: Vec<String>,
}

impl WhisperModelLoader {
    pub fn new(fetcher: HttpModelFetcher, mirrors: Vec<String>) -> Self {
        Self { fetcher, mirrors }
    }

    async fn load_path(path: PathBuf) -> std::result::Result<Arc<dyn RecognizerFactory>, ModelLoadError> {
        let factory = tokio::task::spawn_blocking(move || WhisperRecognizerFactory::load(&path))
            .await
            .map_err(|e| ModelLoadError::Unknown(format!("model load task failed: {}", e)))??;
        Ok(Arc::new(factory))
    }
}

#[async_trait]
impl SourceFetcher<Arc<dyn RecognizerFactory>> for WhisperModelLoader {
    async fn exists(&self, source: &ModelSource) -> bool {
        self.fetcher.exists(source).await
    }

    async fn fetch(
        &self,
        source: &ModelSource,
        progress: &ProgressFn<'_>,
    ) -> std::result::Result<Arc<dyn RecognizerFactory>, ModelLoadError> {
        let path = self.fetcher.fetch(source, progress).await?;
        Self::load_path(path).await
    }
}

#[async_trait]
impl ModelLoader for WhisperModelLoader {
    fn sources(&self) -> Vec<ModelSource> {
        self.fetcher.model().sources(&self.mirrors)
    }

    async fn load_cached(&self) -> Option<Arc<dyn RecognizerFactory>> {
        // Verifying hashes the whole file.
        let fetcher = self.fetcher.clone();
        let path = tokio::task::spawn_blocking(move || fetcher.cached())
            .await
            .ok()
            .flatten()?;
        match Self::load_path(path).await {
            Ok(factory) => Some(factory),
            Err(e) => {
                warn!(error = %e, "Cached model failed to load");
                None
            }
        }
    }
}
