//! Readiness of the dependency behind a recognition strategy.

/// Readiness of a strategy's underlying dependency (a downloaded model, a
/// configured speech service).
///
/// Transitions are monotonic within a process:
/// `Unavailable -> Loading -> {Ready | Unavailable}`. A dependency that can be
/// checked synchronously goes straight from `Unavailable` to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    /// Not usable, either not checked yet or failed to load.
    #[default]
    Unavailable,
    /// Being prepared in the background.
    Loading,
    /// Usable for a listening session.
    Ready,
}

impl Capability {
    /// Whether a strategy backed by this capability can be selected.
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    pub fn can_transition_to(self, next: Capability) -> bool {
        matches!(
            (self, next),
            (Self::Unavailable, Self::Loading)
                | (Self::Unavailable, Self::Ready)
                | (Self::Loading, Self::Ready)
                | (Self::Loading, Self::Unavailable)
        )
    }
}
