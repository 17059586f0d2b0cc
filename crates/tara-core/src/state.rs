//! Listening session phases.

/// The phase a listening session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session running
    #[default]
    Idle,
    /// Waiting for the microphone (or nothing, for simulation)
    Acquiring,
    /// Consuming recognition events
    Listening,
    /// Releasing resources and delivering the outcome
    Finalizing,
}

impl SessionPhase {
    /// Whether a user stop request is accepted in this phase.
    pub fn accepts_stop(self) -> bool {
        matches!(self, Self::Acquiring | Self::Listening)
    }
}
