// Re-export from sub-crates
pub use tara_audio::{AudioSource, CaptureError, Microphone};
pub use tara_core::{
    APP_NAME, APP_NAME_PRETTY, Capability, Config, ConfigManager, DEFAULT_LOG_LEVEL,
    RecognitionEvent, SessionPhase, Strategy, Transcript, VoiceEvent, select_strategy,
};
pub use tara_recognize::{ModelLoadError, OpenAIClient, OpenAIConfig, RecognitionError};

pub mod diagnostics;
pub mod listener;
pub mod prober;
pub mod reply;
pub mod runner;
pub mod sequencer;
pub mod session;

pub use prober::{Capabilities, CapabilityProber};
pub use reply::{KeywordResponder, ReplySink, Responder, TranscriptSink};
pub use runner::{SessionReport, SessionRunner};
pub use sequencer::{SequencerError, VoiceInput};
pub use session::{FailureKind, TerminationReason};

/// Channel every component reports [`VoiceEvent`]s on.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<VoiceEvent>;

// Version from this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
