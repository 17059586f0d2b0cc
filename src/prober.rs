//! Works out which strategies can be used.
//!
//! The native service is checked synchronously from configuration. The local
//! model is loaded in the background: from the cache if possible, otherwise
//! downloaded across the configured mirrors. The prober never fails; every
//! strategy settles to Ready or Unavailable.

use std::sync::Arc;

use parking_lot::RwLock;
use tara_core::{Capability, Strategy, VoiceEvent, select_strategy};
use tara_recognize::{
    MirrorPolicy, ModelLoadError, ModelLoader, RecognizerFactory, fetch_from_mirrors,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::EventSender;
use crate::diagnostics::{DiagnosticsClient, FailureReport};

/// Progress reported once download starts.
const PROGRESS_STARTED: u8 = 5;
/// Progress at the end of the download, before the model is loaded.
const PROGRESS_DOWNLOADED: u8 = 95;

#[derive(Default)]
struct CapabilityState {
    model: Capability,
    native: Capability,
    progress: u8,
    model_error: Option<ModelLoadError>,
    recognizer: Option<Arc<dyn RecognizerFactory>>,
}

impl CapabilityState {
    fn set_model(&mut self, next: Capability) {
        if !self.model.can_transition_to(next) {
            warn!(from = ?self.model, to = ?next, "Unexpected model capability transition");
        }
        self.model = next;
    }
}

/// Read-only view of the prober's findings. Cheap to clone.
#[derive(Clone)]
pub struct Capabilities {
    state: Arc<RwLock<CapabilityState>>,
    settled: watch::Receiver<bool>,
}

impl Capabilities {
    fn new(state: CapabilityState, settled: watch::Receiver<bool>) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            settled,
        }
    }

    /// Capabilities that are already settled, for hosts that probe on their
    /// own.
    pub fn fixed(
        model: Capability,
        native: Capability,
        recognizer: Option<Arc<dyn RecognizerFactory>>,
    ) -> Self {
        let (_, settled) = watch::channel(true);
        Self::new(
            CapabilityState {
                model,
                native,
                progress: if model.is_ready() { 100 } else { 0 },
                model_error: None,
                recognizer,
            },
            settled,
        )
    }

    pub fn model(&self) -> Capability {
        self.state.read().model
    }

    pub fn native(&self) -> Capability {
        self.state.read().native
    }

    /// Model load progress, 0 to 100.
    pub fn progress(&self) -> u8 {
        self.state.read().progress
    }

    /// Why the model is unavailable, once it is.
    pub fn model_error(&self) -> Option<ModelLoadError> {
        self.state.read().model_error.clone()
    }

    pub fn recognizer(&self) -> Option<Arc<dyn RecognizerFactory>> {
        self.state.read().recognizer.clone()
    }

    /// The strategy a session started now would use.
    pub fn strategy(&self) -> Strategy {
        let state = self.state.read();
        select_strategy(state.model, state.native)
    }

    /// Waits until the model has settled to Ready or Unavailable.
    pub async fn settled(&self) {
        let mut settled = self.settled.clone();
        // A closed channel means the probe task is gone; nothing left to wait for.
        settled.wait_for(|done| *done).await.ok();
    }
}

/// Starts capability probing.
pub struct CapabilityProber {
    native_available: bool,
    loader: Option<Arc<dyn ModelLoader>>,
    policy: MirrorPolicy,
    events: EventSender,
    diagnostics: Option<DiagnosticsClient>,
}

impl CapabilityProber {
    pub fn new(events: EventSender) -> Self {
        Self {
            native_available: false,
            loader: None,
            policy: MirrorPolicy::default(),
            events,
            diagnostics: None,
        }
    }

    /// Whether a native speech service is configured.
    pub fn native(mut self, available: bool) -> Self {
        self.native_available = available;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn policy(mut self, policy: MirrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Option<DiagnosticsClient>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Sets the native capability right away and spawns the model load.
    ///
    /// Must be called within a Tokio runtime when a loader is set.
    pub fn start(self) -> Capabilities {
        let native = if self.native_available {
            Capability::Ready
        } else {
            Capability::Unavailable
        };
        info!(native = ?native, "Native speech service checked");

        let Some(loader) = self.loader else {
            info!("No local model backend in this build");
            let (_, settled) = watch::channel(true);
            return Capabilities::new(
                CapabilityState {
                    native,
                    model_error: Some(ModelLoadError::Unsupported),
                    ..Default::default()
                },
                settled,
            );
        };

        let (settled_tx, settled) = watch::channel(false);
        let capabilities = Capabilities::new(
            CapabilityState {
                native,
                model: Capability::Loading,
                ..Default::default()
            },
            settled,
        );

        let probe = ModelProbe {
            capabilities: capabilities.clone(),
            events: self.events,
            diagnostics: self.diagnostics,
        };
        let policy = self.policy;
        tokio::spawn(async move {
            probe.run(loader, policy).await;
            settled_tx.send(true).ok();
        });

        capabilities
    }
}

/// The background half of the prober.
struct ModelProbe {
    capabilities: Capabilities,
    events: EventSender,
    diagnostics: Option<DiagnosticsClient>,
}

impl ModelProbe {
    async fn run(&self, loader: Arc<dyn ModelLoader>, policy: MirrorPolicy) {
        if let Some(factory) = loader.load_cached().await {
            info!("Local model loaded from cache");
            self.ready(factory);
            return;
        }

        let sources = loader.sources();
        debug!(sources = sources.len(), "Fetching local model");
        self.raise_progress(PROGRESS_STARTED);

        let progress = |downloaded: u64, total: u64| {
            if total == 0 {
                return;
            }
            let span = (PROGRESS_DOWNLOADED - PROGRESS_STARTED) as u64;
            let done = (downloaded.min(total) * span / total) as u8;
            self.raise_progress(PROGRESS_STARTED + done);
        };

        match fetch_from_mirrors(loader.as_ref(), &sources, &policy, &progress).await {
            Ok(fetched) => {
                info!(source = %fetched.source, "Local model ready");
                self.ready(fetched.value);
            }
            Err(failure) => {
                warn!(error = %failure.error, reachable = failure.reachable, "Local model unavailable");
                let message = failure.error.user_message();
                {
                    let mut state = self.capabilities.state.write();
                    state.set_model(Capability::Unavailable);
                    state.model_error = Some(failure.error.clone());
                }
                self.events.send(VoiceEvent::Error(message.to_string())).ok();

                if let Some(diagnostics) = &self.diagnostics {
                    diagnostics.report(FailureReport::model_load(&failure.error, failure.reachable));
                }
            }
        }
    }

    fn ready(&self, factory: Arc<dyn RecognizerFactory>) {
        {
            let mut state = self.capabilities.state.write();
            state.recognizer = Some(factory);
            state.set_model(Capability::Ready);
        }
        self.raise_progress(100);
    }

    /// Progress only ever moves forward.
    fn raise_progress(&self, value: u8) {
        let value = value.min(100);
        {
            let mut state = self.capabilities.state.write();
            if value <= state.progress {
                return;
            }
            state.progress = value;
        }
        self.events.send(VoiceEvent::ModelProgress(value)).ok();
    }
}
