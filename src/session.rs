//! The per-session state machine.
//!
//! A [`ListeningSession`] is driven only through [`ListeningSession::dispatch`].
//! The first input that terminates the session wins: once the session has
//! reached Finalizing every further input except `Released` is ignored.

use tara_audio::CaptureError;
use tara_core::{RecognitionEvent, ResultKind, SessionPhase, Strategy, Transcript};
use tokio::time::Instant;
use tracing::{debug, info};

/// Why a session ended in error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Microphone access was refused
    PermissionDenied,
    /// There is no input device
    NoMicrophone,
    /// The input device failed or stopped delivering audio
    Device,
    /// The recognizer or speech service failed
    Recognition,
    /// A final result could not be decoded
    MalformedResult,
}

impl FailureKind {
    pub fn from_capture(error: &CaptureError) -> Self {
        match error {
            CaptureError::PermissionDenied => Self::PermissionDenied,
            CaptureError::NoInputDevice => Self::NoMicrophone,
            CaptureError::SampleFormatNotSupported(_) | CaptureError::Stream(_) => Self::Device,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Please allow microphone access to use voice input. Showing a demo instead."
            }
            Self::NoMicrophone => "No microphone was found. Showing a demo instead.",
            Self::Device => "The microphone stopped working. Showing a demo instead.",
            Self::Recognition | Self::MalformedResult => {
                "Speech recognition failed. Showing a demo instead."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    UserStopped,
    FinalResult,
    TimeoutWithContent,
    TimeoutEmpty,
    Error(FailureKind),
}

impl TerminationReason {
    /// Status message for the host, if this outcome needs one.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::TimeoutEmpty => Some("Nothing heard, try again."),
            Self::Error(kind) => Some(kind.user_message()),
            Self::UserStopped | Self::FinalResult | Self::TimeoutWithContent => None,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub reason: TerminationReason,
    pub transcript: Option<Transcript>,
}

impl Termination {
    /// Errors in a microphone-backed strategy hand over to the simulation.
    pub fn wants_fallback(&self, strategy: Strategy) -> bool {
        matches!(self.reason, TerminationReason::Error(_)) && strategy != Strategy::Simulated
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Start,
    Acquired,
    AcquireFailed(FailureKind),
    Recognition(RecognitionEvent),
    RecognitionFailed(FailureKind),
    /// The listener stopped producing events on its own
    StreamEnded,
    Stop { flushed: Option<String> },
    Timeout { flushed: Option<String> },
    /// All resources of the session have been freed
    Released,
}

/// Result of a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The input does not apply in the current phase
    Ignored,
    Continue,
    PartialUpdated(String),
    Terminated(Termination),
}

#[derive(Debug)]
pub struct ListeningSession {
    id: u64,
    strategy: Strategy,
    started: Instant,
    phase: SessionPhase,
    partial: Option<String>,
    termination: Option<Termination>,
}

impl ListeningSession {
    pub fn new(id: u64, strategy: Strategy) -> Self {
        Self {
            id,
            strategy,
            started: Instant::now(),
            phase: SessionPhase::Idle,
            partial: None,
            termination: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The latest partial transcript.
    pub fn partial(&self) -> Option<&str> {
        self.partial.as_deref()
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    /// Whether the session went through Finalizing and back to Idle.
    pub fn is_complete(&self) -> bool {
        self.phase == SessionPhase::Idle && self.termination.is_some()
    }

    pub fn dispatch(&mut self, input: SessionInput) -> Step {
        match (self.phase, input) {
            (SessionPhase::Idle, SessionInput::Start) if self.termination.is_none() => {
                self.phase = SessionPhase::Acquiring;
                Step::Continue
            }

            (SessionPhase::Acquiring, SessionInput::Acquired) => {
                self.phase = SessionPhase::Listening;
                Step::Continue
            }
            (SessionPhase::Acquiring, SessionInput::AcquireFailed(kind)) => {
                self.terminate(TerminationReason::Error(kind), None)
            }

            (SessionPhase::Listening, SessionInput::Recognition(event)) => self.recognized(event),
            (SessionPhase::Listening, SessionInput::RecognitionFailed(kind)) => {
                self.terminate(TerminationReason::Error(kind), None)
            }
            (SessionPhase::Listening, SessionInput::StreamEnded) => {
                self.terminate(TerminationReason::Error(FailureKind::Device), None)
            }
            (SessionPhase::Listening, SessionInput::Timeout { flushed }) => {
                match self.captured(flushed) {
                    Some(transcript) => {
                        self.terminate(TerminationReason::TimeoutWithContent, Some(transcript))
                    }
                    None => self.terminate(TerminationReason::TimeoutEmpty, None),
                }
            }

            (phase, SessionInput::Stop { flushed }) if phase.accepts_stop() => {
                let transcript = self.captured(flushed);
                self.terminate(TerminationReason::UserStopped, transcript)
            }

            (SessionPhase::Finalizing, SessionInput::Released) => {
                self.phase = SessionPhase::Idle;
                Step::Continue
            }

            (phase, input) => {
                debug!(session = self.id, phase = ?phase, input = ?input, "Ignoring session input");
                Step::Ignored
            }
        }
    }

    fn recognized(&mut self, event: RecognitionEvent) -> Step {
        match event {
            RecognitionEvent::Partial(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Step::Ignored;
                }
                self.partial = Some(text.to_string());
                Step::PartialUpdated(text.to_string())
            }
            RecognitionEvent::Final(text) => match Transcript::new(&text) {
                Some(transcript) => self.terminate(TerminationReason::FinalResult, Some(transcript)),
                None => Step::Ignored,
            },
            RecognitionEvent::Malformed(ResultKind::Partial) => {
                debug!(session = self.id, "Dropping malformed partial result");
                Step::Ignored
            }
            RecognitionEvent::Malformed(ResultKind::Final) => {
                self.terminate(TerminationReason::Error(FailureKind::MalformedResult), None)
            }
        }
    }

    /// Flushed recognizer text if there is any, otherwise the last partial.
    fn captured(&self, flushed: Option<String>) -> Option<Transcript> {
        flushed
            .and_then(Transcript::new)
            .or_else(|| self.partial.as_deref().and_then(Transcript::new))
    }

    fn terminate(&mut self, reason: TerminationReason, transcript: Option<Transcript>) -> Step {
        info!(
            session = self.id,
            strategy = %self.strategy,
            reason = ?reason,
            elapsed = ?self.started.elapsed(),
            "Session finalizing"
        );
        let termination = Termination { reason, transcript };
        self.phase = SessionPhase::Finalizing;
        self.termination = Some(termination.clone());
        Step::Terminated(termination)
    }
}
