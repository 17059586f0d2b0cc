//! Hosted speech service used by the `native` strategy.
//!
//! The service consumes 16 kHz mono frames and answers with result sets.
//! Each entry in a set is either interim or final, mirroring how streaming
//! speech APIs report their output.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use tara_audio::{DetectorConfig, Segment, UtteranceDetector, to_i16};
use tara_core::{RecognitionEvent, ResultKind};
use tracing::{debug, warn};

use crate::{RecognitionError, Result, Transcriber, strip_non_speech};

/// One entry of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechResult {
    pub transcript: String,
    pub is_final: bool,
}

impl SpeechResult {
    pub fn interim(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: false,
        }
    }

    pub fn final_result(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: true,
        }
    }
}

/// Results delivered by one service callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub results: Vec<SpeechResult>,
}

impl ResultSet {
    pub fn new(results: Vec<SpeechResult>) -> Self {
        Self { results }
    }

    /// Splits the set into its (final, interim) text.
    pub fn buckets(&self) -> (String, String) {
        let join = |want_final: bool| {
            self.results
                .iter()
                .filter(|r| r.is_final == want_final)
                .map(|r| r.transcript.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        };
        (join(true), join(false))
    }

    /// A non-empty final bucket wins over interim text.
    pub fn into_event(self) -> Option<RecognitionEvent> {
        let (final_text, interim_text) = self.buckets();
        if !final_text.is_empty() {
            Some(RecognitionEvent::Final(final_text))
        } else if !interim_text.is_empty() {
            Some(RecognitionEvent::Partial(interim_text))
        } else {
            None
        }
    }
}

/// What a hosted recognition reports after being fed a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeUpdate {
    Results(ResultSet),
    /// The service answered with something that could not be decoded
    Malformed(ResultKind),
}

impl NativeUpdate {
    pub fn into_event(self) -> Option<RecognitionEvent> {
        match self {
            Self::Results(set) => set.into_event(),
            Self::Malformed(kind) => Some(RecognitionEvent::Malformed(kind)),
        }
    }
}

/// A speech service that can start recognitions.
#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn start(&self) -> Result<Box<dyn RecognitionHandle>>;

    fn name(&self) -> &str;
}

/// A running recognition.
#[async_trait]
pub trait RecognitionHandle: Send {
    /// Feeds one 16 kHz mono frame.
    async fn feed(&mut self, frame: &[f32]) -> Result<Option<NativeUpdate>>;

    /// Stops the recognition. Later frames are ignored.
    fn stop(&mut self);
}

/// Speech service backed by a one-shot [`Transcriber`].
///
/// Utterances are cut by loudness; the audio heard so far is sent for an
/// interim result at every interim interval and for a final result when the
/// utterance ends.
#[derive(Clone)]
pub struct HostedSpeechService {
    transcriber: Arc<dyn Transcriber>,
    language: Option<String>,
    detector: DetectorConfig,
}

impl HostedSpeechService {
    pub fn new(transcriber: Arc<dyn Transcriber>, language: Option<String>) -> Self {
        Self {
            transcriber,
            language,
            detector: DetectorConfig::default(),
        }
    }
}

#[async_trait]
impl SpeechService for HostedSpeechService {
    async fn start(&self) -> Result<Box<dyn RecognitionHandle>> {
        debug!(service = self.transcriber.name(), "Starting hosted recognition");
        Ok(Box::new(HostedRecognition {
            transcriber: self.transcriber.clone(),
            language: self.language.clone(),
            detector: UtteranceDetector::new(self.detector),
            sample_rate: self.detector.sample_rate,
            buffer: Vec::new(),
            stopped: false,
        }))
    }

    fn name(&self) -> &str {
        self.transcriber.name()
    }
}

pub struct HostedRecognition {
    transcriber: Arc<dyn Transcriber>,
    language: Option<String>,
    detector: UtteranceDetector,
    sample_rate: u32,
    buffer: Vec<f32>,
    stopped: bool,
}

impl HostedRecognition {
    async fn recognize(&self, kind: ResultKind) -> Result<NativeUpdate> {
        let wav = encode_wav(&self.buffer, self.sample_rate)?;
        match self.transcriber.transcribe(&wav, self.language.as_deref()).await {
            Ok(text) => {
                let text = strip_non_speech(&text);
                let result = match kind {
                    ResultKind::Partial => SpeechResult::interim(text),
                    ResultKind::Final => SpeechResult::final_result(text),
                };
                Ok(NativeUpdate::Results(ResultSet::new(vec![result])))
            }
            Err(RecognitionError::MalformedResponse(e)) => {
                warn!(kind = ?kind, error = %e, "Malformed recognition result");
                Ok(NativeUpdate::Malformed(kind))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RecognitionHandle for HostedRecognition {
    async fn feed(&mut self, frame: &[f32]) -> Result<Option<NativeUpdate>> {
        if self.stopped {
            return Ok(None);
        }

        match self.detector.push(frame) {
            Segment::Silence => {
                // Keep one frame of lead-in so the first syllable is not clipped.
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
                self.recognize(ResultKind::Partial).await.map(Some)
            }
            Segment::EndOfUtterance => {
                self.buffer.extend_from_slice(frame);
                let update = self.recognize(ResultKind::Final).await;
                self.buffer.clear();
                update.map(Some)
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.buffer.clear();
        self.detector.reset();
    }
}

/// Encodes mono samples as 16-bit PCM WAV.
fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let wav_error = |e: hound::Error| RecognitionError::InvalidAudioFormat(e.to_string());

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
        for sample in to_i16(samples) {
            writer.write_sample(sample).map_err(wav_error)?;
        }
        writer.finalize().map_err(wav_error)?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    const FRAME: usize = 1600;

    struct FakeTranscriber {
        replies: Mutex<VecDeque<Result<String>>>,
        received: Mutex<Vec<usize>>,
    }

    impl FakeTranscriber {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, audio: &[u8], _language: Option<&str>) -> Result<String> {
            self.received.lock().unwrap().push(audio.len());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn loud() -> Vec<f32> {
        vec![0.5; FRAME]
    }

    fn quiet() -> Vec<f32> {
        vec![0.0; FRAME]
    }

    async fn feed_all(handle: &mut Box<dyn RecognitionHandle>, frames: Vec<Vec<f32>>) -> Vec<NativeUpdate> {
        let mut updates = Vec::new();
        for frame in frames {
            if let Some(update) = handle.feed(&frame).await.unwrap() {
                updates.push(update);
            }
        }
        updates
    }

    #[test]
    fn test_final_bucket_wins() {
        let set = ResultSet::new(vec![
            SpeechResult::interim("a session"),
            SpeechResult::final_result("Book"),
        ]);
        assert_eq!(set.buckets(), ("Book".to_string(), "a session".to_string()));
        assert_eq!(set.into_event(), Some(RecognitionEvent::Final("Book".to_string())));
    }

    #[test]
    fn test_empty_final_bucket_falls_back_to_interim() {
        let set = ResultSet::new(vec![
            SpeechResult::final_result("  "),
            SpeechResult::interim("Book a"),
        ]);
        assert_eq!(set.into_event(), Some(RecognitionEvent::Partial("Book a".to_string())));
        assert_eq!(ResultSet::default().into_event(), None);
    }

    #[tokio::test]
    async fn test_interim_then_final() {
        let transcriber = FakeTranscriber::new(vec![Ok("Book".into()), Ok("Book a session".into())]);
        let service = HostedSpeechService::new(transcriber.clone(), None);
        let mut handle = service.start().await.unwrap();

        let mut frames = vec![quiet(); 3];
        frames.extend(vec![loud(); 10]);
        frames.extend(vec![quiet(); 8]);
        let events: Vec<_> = feed_all(&mut handle, frames)
            .await
            .into_iter()
            .filter_map(NativeUpdate::into_event)
            .collect();

        assert_eq!(
            events,
            vec![
                RecognitionEvent::Partial("Book".to_string()),
                RecognitionEvent::Final("Book a session".to_string()),
            ]
        );

        // One frame of lead-in plus ten loud frames.
        let received = transcriber.received.lock().unwrap().clone();
        let expected = encode_wav(&vec![0.0; 11 * FRAME], 16_000).unwrap().len();
        assert_eq!(received[0], expected);
    }

    #[tokio::test]
    async fn test_non_speech_markers_produce_no_result() {
        let transcriber = FakeTranscriber::new(vec![
            Ok("[BLANK_AUDIO]".into()),
            Ok(" (clicking) ".into()),
        ]);
        let service = HostedSpeechService::new(transcriber.clone(), None);
        let mut handle = service.start().await.unwrap();

        let mut frames = vec![loud(); 10];
        frames.extend(vec![quiet(); 8]);
        let events: Vec<_> = feed_all(&mut handle, frames)
            .await
            .into_iter()
            .filter_map(NativeUpdate::into_event)
            .collect();

        assert!(events.is_empty());
        assert_eq!(transcriber.received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_response_is_reported_with_kind() {
        let transcriber = FakeTranscriber::new(vec![Err(RecognitionError::MalformedResponse("eof".into()))]);
        let service = HostedSpeechService::new(transcriber, None);
        let mut handle = service.start().await.unwrap();

        let updates = feed_all(&mut handle, vec![loud(); 10]).await;
        assert_eq!(updates, vec![NativeUpdate::Malformed(ResultKind::Partial)]);
    }

    #[tokio::test]
    async fn test_service_error_propagates() {
        let transcriber = FakeTranscriber::new(vec![Err(RecognitionError::ApiError("500".into()))]);
        let service = HostedSpeechService::new(transcriber, None);
        let mut handle = service.start().await.unwrap();

        for _ in 0..9 {
            handle.feed(&loud()).await.unwrap();
        }
        assert!(handle.feed(&loud()).await.is_err());
    }

    #[tokio::test]
    async fn test_stopped_recognition_ignores_frames() {
        let transcriber = FakeTranscriber::new(vec![Ok("Book".into())]);
        let service = HostedSpeechService::new(transcriber.clone(), None);
        let mut handle = service.start().await.unwrap();

        handle.stop();
        let updates = feed_all(&mut handle, vec![loud(); 20]).await;
        assert!(updates.is_empty());
        assert!(transcriber.received.lock().unwrap().is_empty());
    }
}
