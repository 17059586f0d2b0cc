//! Recognition results and the status events surfaced to the host.

use std::fmt;

use crate::{SessionPhase, Strategy};

/// Whether a recognizer payload was an in-progress or a committed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Partial,
    Final,
}

/// A single update from a recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// In-progress transcription, superseded by later partials or a final.
    Partial(String),
    /// Committed transcription for an utterance.
    Final(String),
    /// The recognizer produced output that could not be decoded.
    Malformed(ResultKind),
}

/// A finalized, non-empty transcript handed to the transcript consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript(String);

impl Transcript {
    /// Builds a transcript from recognizer text. Returns `None` when the text
    /// is blank.
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        let text = text.as_ref().trim();
        if text.is_empty() {
            None
        } else {
            Some(Self(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for Transcript {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status signals for the hosting UI. Rendering only, never control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// A session started with this strategy
    StrategySelected(Strategy),
    /// The active session moved to a new phase
    PhaseChanged(SessionPhase),
    /// Local model load progress, 0 to 100
    ModelProgress(u8),
    /// Live partial transcript
    Partial(String),
    /// A session produced a transcript
    Transcript(Transcript),
    /// The assistant's reply to a transcript
    Reply(String),
    /// Human-readable error or status message
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_trims() {
        let transcript = Transcript::new("  Book a session \n").unwrap();
        assert_eq!(transcript.as_str(), "Book a session");
    }

    #[test]
    fn test_blank_transcript_rejected() {
        assert!(Transcript::new("").is_none());
        assert!(Transcript::new("   ").is_none());
    }
}
