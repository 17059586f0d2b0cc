//! Speech capture strategies and the selection rule between them.

use std::fmt;

use crate::Capability;

/// One of the mutually exclusive speech capture implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Local recognition model fed from the microphone.
    Model,
    /// Hosted speech service fed from the microphone.
    Native,
    /// Scripted transcription, needs no hardware or network.
    Simulated,
}

impl Strategy {
    /// Returns the name of this strategy for logging/display.
    pub fn name(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Native => "native",
            Self::Simulated => "simulated",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Picks the strategy for a new listening session.
///
/// The local model wins when ready, then the hosted service. Simulation is
/// the fallback for every other combination, so a session always has a way
/// to produce a transcript.
pub fn select_strategy(model: Capability, native: Capability) -> Strategy {
    if model.is_ready() {
        Strategy::Model
    } else if native.is_ready() {
        Strategy::Native
    } else {
        Strategy::Simulated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Capability::{Loading, Ready, Unavailable};

    #[test]
    fn test_select_strategy_combinations() {
        assert_eq!(select_strategy(Ready, Ready), Strategy::Model);
        assert_eq!(select_strategy(Ready, Unavailable), Strategy::Model);
        assert_eq!(select_strategy(Unavailable, Ready), Strategy::Native);
        assert_eq!(select_strategy(Unavailable, Unavailable), Strategy::Simulated);
    }

    #[test]
    fn test_loading_model_is_not_selected() {
        assert_eq!(select_strategy(Loading, Ready), Strategy::Native);
        assert_eq!(select_strategy(Loading, Unavailable), Strategy::Simulated);
    }
}
