//! The three listening strategies behind one interface.
//!
//! A [`Listener`] owns everything a session acquired. The runner polls it for
//! recognition events and releases it when the session ends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tara_audio::{AudioCapture, AudioSource, FrameConverter};
use tara_core::{Config, RecognitionEvent, Strategy};
use tara_recognize::{RecognitionHandle, SpeechService, StreamingRecognizer};
use tracing::{debug, info, warn};

use crate::prober::Capabilities;
use crate::session::FailureKind;

/// Phrases the simulation types out.
const DEMO_PHRASES: &[&str] = &[
    "I would like to book a session for next Tuesday",
    "How much does the monthly subscription cost",
    "Please cancel my appointment on Friday",
    "How many loyalty points do I have",
];

/// A running strategy.
#[async_trait]
pub trait Listener: Send {
    fn strategy(&self) -> Strategy;

    /// Waits for the next recognition event. `None` means the source ended.
    ///
    /// The runner drops this future when a stop or the timeout wins the race.
    /// Dropping it may lose the frame in flight, never an event already
    /// produced.
    async fn next_event(&mut self) -> Option<Result<RecognitionEvent, FailureKind>>;

    /// Whatever text is available right now, used on stop and timeout.
    async fn flush(&mut self) -> Option<String>;

    /// Frees the microphone and any recognition handle. Idempotent.
    fn release(&mut self);
}

/// Opens listeners for a strategy.
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn open(&self, strategy: Strategy, session_id: u64) -> Result<Box<dyn Listener>, FailureKind>;
}

/// How a listener reports a capture that stopped delivering chunks.
fn capture_ended(capture: &AudioCapture) -> Option<Result<RecognitionEvent, FailureKind>> {
    let error = capture.failure()?;
    warn!(error = %error, "Microphone failed mid-session");
    Some(Err(FailureKind::from_capture(error)))
}

/// Feeds microphone frames to a local recognizer.
pub struct ModelListener {
    capture: AudioCapture,
    converter: FrameConverter,
    recognizer: Box<dyn StreamingRecognizer>,
    pending: VecDeque<Vec<f32>>,
}

impl ModelListener {
    pub fn new(capture: AudioCapture, recognizer: Box<dyn StreamingRecognizer>) -> Self {
        let converter = FrameConverter::new(capture.format());
        Self {
            capture,
            converter,
            recognizer,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl Listener for ModelListener {
    fn strategy(&self) -> Strategy {
        Strategy::Model
    }

    async fn next_event(&mut self) -> Option<Result<RecognitionEvent, FailureKind>> {
        loop {
            while let Some(frame) = self.pending.pop_front() {
                match self.recognizer.accept(&frame).await {
                    Ok(Some(event)) => return Some(Ok(event)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(recognizer = self.recognizer.name(), error = %e, "Recognizer failed");
                        return Some(Err(FailureKind::Recognition));
                    }
                }
            }
            let Some(chunk) = self.capture.next_chunk().await else {
                return capture_ended(&self.capture);
            };
            self.pending.extend(self.converter.push(&chunk));
        }
    }

    async fn flush(&mut self) -> Option<String> {
        self.recognizer.flush().await
    }

    fn release(&mut self) {
        self.pending.clear();
        self.capture.release();
    }
}

/// Feeds microphone frames to a speech service.
pub struct NativeListener {
    capture: AudioCapture,
    converter: FrameConverter,
    handle: Box<dyn RecognitionHandle>,
    pending: VecDeque<Vec<f32>>,
    stopped: bool,
}

impl NativeListener {
    pub fn new(capture: AudioCapture, handle: Box<dyn RecognitionHandle>) -> Self {
        let converter = FrameConverter::new(capture.format());
        Self {
            capture,
            converter,
            handle,
            pending: VecDeque::new(),
            stopped: false,
        }
    }
}

#[async_trait]
impl Listener for NativeListener {
    fn strategy(&self) -> Strategy {
        Strategy::Native
    }

    async fn next_event(&mut self) -> Option<Result<RecognitionEvent, FailureKind>> {
        loop {
            while let Some(frame) = self.pending.pop_front() {
                match self.handle.feed(&frame).await {
                    Ok(Some(update)) => {
                        if let Some(event) = update.into_event() {
                            return Some(Ok(event));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Speech service failed");
                        return Some(Err(FailureKind::Recognition));
                    }
                }
            }
            let Some(chunk) = self.capture.next_chunk().await else {
                return capture_ended(&self.capture);
            };
            self.pending.extend(self.converter.push(&chunk));
        }
    }

    // The service reports through result sets only; the session keeps the
    // last interim text.
    async fn flush(&mut self) -> Option<String> {
        None
    }

    fn release(&mut self) {
        if !self.stopped {
            self.handle.stop();
            self.stopped = true;
        }
        self.pending.clear();
        self.capture.release();
    }
}

/// Timing of the simulated transcription.
#[derive(Debug, Clone, Copy)]
pub struct SimulationConfig {
    pub tick: Duration,
    pub pause: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(400),
            pause: Duration::from_millis(800),
        }
    }
}

impl SimulationConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: config.simulation_tick(),
            pause: config.simulation_pause(),
        }
    }
}

/// Types out a canned phrase word by word, then finalizes it.
///
/// Completes within `words * tick + pause` and needs no hardware.
pub struct SimulatedListener {
    words: Vec<String>,
    revealed: usize,
    finished: bool,
    timing: SimulationConfig,
}

impl SimulatedListener {
    pub fn new(phrase: &str, timing: SimulationConfig) -> Self {
        Self {
            words: phrase.split_whitespace().map(str::to_string).collect(),
            revealed: 0,
            finished: false,
            timing,
        }
    }

    /// Picks the phrase for a session.
    pub fn for_session(session_id: u64, timing: SimulationConfig) -> Self {
        let phrase = DEMO_PHRASES[(session_id % DEMO_PHRASES.len() as u64) as usize];
        Self::new(phrase, timing)
    }

    /// Upper bound on how long the simulation runs.
    pub fn duration(&self) -> Duration {
        self.timing.tick * self.words.len() as u32 + self.timing.pause
    }

    fn text(&self) -> String {
        self.words[..self.revealed].join(" ")
    }
}

#[async_trait]
impl Listener for SimulatedListener {
    fn strategy(&self) -> Strategy {
        Strategy::Simulated
    }

    async fn next_event(&mut self) -> Option<Result<RecognitionEvent, FailureKind>> {
        if self.revealed < self.words.len() {
            tokio::time::sleep(self.timing.tick).await;
            self.revealed += 1;
            return Some(Ok(RecognitionEvent::Partial(self.text())));
        }
        if !self.finished {
            tokio::time::sleep(self.timing.pause).await;
            self.finished = true;
            return Some(Ok(RecognitionEvent::Final(self.text())));
        }
        // Nothing left to say; the session is already finalizing.
        std::future::pending().await
    }

    async fn flush(&mut self) -> Option<String> {
        Some(self.text()).filter(|t| !t.is_empty())
    }

    fn release(&mut self) {
        debug!("Simulation released");
    }
}

/// Opens listeners from the available backends.
pub struct Backends {
    microphone: Arc<dyn AudioSource>,
    capabilities: Capabilities,
    speech: Option<Arc<dyn SpeechService>>,
    simulation: SimulationConfig,
    language: Option<String>,
}

impl Backends {
    pub fn new(microphone: Arc<dyn AudioSource>, capabilities: Capabilities) -> Self {
        Self {
            microphone,
            capabilities,
            speech: None,
            simulation: SimulationConfig::default(),
            language: None,
        }
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechService>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_simulation(mut self, simulation: SimulationConfig) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    async fn acquire(&self) -> Result<AudioCapture, FailureKind> {
        self.microphone.acquire().await.map_err(|e| {
            warn!(error = %e, "Failed to acquire microphone");
            FailureKind::from_capture(&e)
        })
    }
}

#[async_trait]
impl ListenerFactory for Backends {
    async fn open(&self, strategy: Strategy, session_id: u64) -> Result<Box<dyn Listener>, FailureKind> {
        match strategy {
            Strategy::Simulated => Ok(Box::new(SimulatedListener::for_session(
                session_id,
                self.simulation,
            ))),
            Strategy::Model => {
                let factory = self.capabilities.recognizer().ok_or(FailureKind::Recognition)?;
                let recognizer = factory.create(self.language.as_deref()).map_err(|e| {
                    warn!(error = %e, "Failed to create recognizer");
                    FailureKind::Recognition
                })?;
                let capture = self.acquire().await?;
                info!(session = session_id, recognizer = recognizer.name(), "Listening with local model");
                Ok(Box::new(ModelListener::new(capture, recognizer)))
            }
            Strategy::Native => {
                let speech = self.speech.clone().ok_or(FailureKind::Recognition)?;
                let capture = self.acquire().await?;
                // The capture is released on drop if the service fails to start.
                let handle = speech.start().await.map_err(|e| {
                    warn!(error = %e, "Failed to start speech service");
                    FailureKind::Recognition
                })?;
                info!(session = session_id, service = speech.name(), "Listening with speech service");
                Ok(Box::new(NativeListener::new(capture, handle)))
            }
        }
    }
}
