//! The voice input entry point used by hosts.

use std::sync::Arc;

use tara_audio::{AudioSource, Microphone};
use tara_core::{Capability, Config, Strategy};
use tara_recognize::{HostedSpeechService, MirrorPolicy, OpenAIClient, OpenAIConfig, SpeechService};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::EventSender;
use crate::diagnostics::DiagnosticsClient;
use crate::listener::{Backends, ListenerFactory, SimulationConfig};
use crate::prober::{Capabilities, CapabilityProber};
use crate::reply::{ReplySink, TranscriptSink};
use crate::runner::{SessionReport, SessionRunner};

#[derive(Debug, Error)]
pub enum SequencerError {
    /// A session is already running; stop it first
    #[error("a listening session is already active")]
    SessionActive,
}

struct ActiveSession {
    stop: watch::Sender<bool>,
    task: JoinHandle<SessionReport>,
}

/// Selects a strategy per request and runs at most one session at a time.
pub struct VoiceInput {
    capabilities: Capabilities,
    runner: Arc<SessionRunner>,
    active: Option<ActiveSession>,
}

impl VoiceInput {
    pub fn new(capabilities: Capabilities, runner: SessionRunner) -> Self {
        Self {
            capabilities,
            runner: Arc::new(runner),
            active: None,
        }
    }

    /// Wires up the prober, backends and reply sink from configuration.
    ///
    /// Must be called within a Tokio runtime.
    pub fn from_config(config: &Config, events: EventSender) -> anyhow::Result<Self> {
        let speech: Option<Arc<dyn SpeechService>> = config.key_openai().map(|key| {
            let mut openai = OpenAIConfig::new(key);
            if let Some(model) = config.service_model() {
                openai = openai.with_model(model);
            }
            let transcriber = Arc::new(OpenAIClient::new(openai));
            Arc::new(HostedSpeechService::new(transcriber, config.language().map(str::to_string)))
                as Arc<dyn SpeechService>
        });

        let policy = MirrorPolicy {
            probe: true,
            probe_timeout: config.probe_timeout(),
            source_timeout: config.source_timeout(),
            global_timeout: config.download_timeout(),
        };

        let mut prober = CapabilityProber::new(events.clone())
            .native(speech.is_some())
            .policy(policy)
            .diagnostics(config.diagnostics_endpoint().map(DiagnosticsClient::new));
        if let Some(loader) = model_loader(config)? {
            prober = prober.loader(loader);
        }
        let capabilities = prober.start();

        let microphone: Arc<dyn AudioSource> = match config.input_device() {
            Some(name) => Arc::new(Microphone::with_device(name)),
            None => Arc::new(Microphone::default()),
        };
        let mut backends = Backends::new(microphone, capabilities.clone())
            .with_simulation(SimulationConfig::from_config(config))
            .with_language(config.language().map(str::to_string));
        if let Some(speech) = speech {
            backends = backends.with_speech(speech);
        }

        let factory: Arc<dyn ListenerFactory> = Arc::new(backends);
        let sink: Arc<dyn TranscriptSink> = Arc::new(ReplySink::new(events.clone()));
        let runner = SessionRunner::new(factory, sink, events, config.session_timeout());

        Ok(Self::new(capabilities, runner))
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Whether a session is running. A session that already finished counts
    /// as not listening.
    pub fn is_listening(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Starts a session with the strategy the current capabilities allow.
    pub fn start(&mut self) -> Result<Strategy, SequencerError> {
        if self.is_listening() {
            return Err(SequencerError::SessionActive);
        }
        // A finished session that was never collected.
        self.active = None;

        let strategy = self.capabilities.strategy();
        info!(strategy = %strategy, "Voice input requested");
        if self.capabilities.model() == Capability::Loading {
            info!(progress = self.capabilities.progress(), "Local model still loading");
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let runner = self.runner.clone();
        let task = tokio::spawn(async move { runner.run(strategy, &mut stop_rx).await });
        self.active = Some(ActiveSession { stop, task });
        Ok(strategy)
    }

    /// Asks the running session to stop. No effect without one.
    pub fn stop(&self) {
        if let Some(active) = &self.active {
            active.stop.send(true).ok();
        }
    }

    /// Waits for the current session to finish and returns its report.
    pub async fn finish(&mut self) -> Option<SessionReport> {
        let active = self.active.take()?;
        match active.task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Session task failed");
                None
            }
        }
    }

    /// Stops any running session and waits until its resources are released.
    pub async fn shutdown(&mut self) -> Option<SessionReport> {
        self.stop();
        self.finish().await
    }
}

#[cfg(feature = "local-whisper")]
fn model_loader(config: &Config) -> anyhow::Result<Option<Arc<dyn tara_recognize::ModelLoader>>> {
    use tara_recognize::{HttpModelFetcher, WhisperModel, WhisperModelLoader};

    let model = WhisperModel::from_config(config.model());
    let fetcher = HttpModelFetcher::new(model, tara_core::models_dir()?);
    Ok(Some(Arc::new(WhisperModelLoader::new(
        fetcher,
        config.model_mirrors().to_vec(),
    ))))
}

#[cfg(not(feature = "local-whisper"))]
fn model_loader(_config: &Config) -> anyhow::Result<Option<Arc<dyn tara_recognize::ModelLoader>>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tara_core::{Transcript, VoiceEvent};
    use tokio::sync::mpsc;

    use super::*;

    struct NullSink;

    impl TranscriptSink for NullSink {
        fn on_transcript(&self, _transcript: Transcript) {}
    }

    fn voice_input(model: Capability, native: Capability) -> (VoiceInput, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let capabilities = Capabilities::fixed(model, native, None);
        let microphone: Arc<dyn AudioSource> = Arc::new(Microphone::default());
        let backends = Backends::new(microphone, capabilities.clone()).with_simulation(SimulationConfig {
            tick: Duration::from_millis(100),
            pause: Duration::from_millis(100),
        });
        let runner = SessionRunner::new(Arc::new(backends), Arc::new(NullSink), tx, Duration::from_secs(10));
        (VoiceInput::new(capabilities, runner), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let (mut voice, _events) = voice_input(Capability::Unavailable, Capability::Unavailable);

        assert_eq!(voice.start().unwrap(), Strategy::Simulated);
        assert!(matches!(voice.start(), Err(SequencerError::SessionActive)));

        let report = voice.finish().await.unwrap();
        assert_eq!(report.attempts.len(), 1);
        assert!(report.transcript().is_some());
        assert!(!voice.is_listening());

        // Stop-before-start discipline satisfied; a new session may begin.
        assert_eq!(voice.start().unwrap(), Strategy::Simulated);
        voice.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_session() {
        let (mut voice, mut events) = voice_input(Capability::Unavailable, Capability::Unavailable);
        voice.start().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let report = voice.shutdown().await.unwrap();
        let transcript = report.transcript().unwrap();
        assert_eq!(transcript.as_str().split_whitespace().count(), 2);

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let VoiceEvent::PhaseChanged(phase) = event {
                phases.push(phase);
            }
        }
        assert_eq!(phases.last(), Some(&tara_core::SessionPhase::Idle));
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let (mut voice, _events) = voice_input(Capability::Unavailable, Capability::Unavailable);
        voice.stop();
        assert!(voice.finish().await.is_none());
    }
}
