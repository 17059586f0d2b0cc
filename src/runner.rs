//! Runs listening sessions.
//!
//! One call to [`SessionRunner::run`] executes the requested strategy and, if
//! it fails in a way the user cannot fix by retrying, a follow-up simulated
//! session. Each attempt is its own [`ListeningSession`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tara_core::{RecognitionEvent, SessionPhase, Strategy, Transcript, VoiceEvent};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::EventSender;
use crate::listener::{Listener, ListenerFactory};
use crate::reply::TranscriptSink;
use crate::session::{
    FailureKind, ListeningSession, SessionInput, Step, Termination, TerminationReason,
};

/// Longest a stop or timeout waits for the recognizer's pending text.
const FLUSH_LIMIT: Duration = Duration::from_secs(1);

/// The outcome of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub session_id: u64,
    pub strategy: Strategy,
    pub termination: Termination,
}

/// Every session run for one listening request, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub attempts: Vec<Attempt>,
}

impl SessionReport {
    /// The transcript delivered for this request, if any.
    pub fn transcript(&self) -> Option<&Transcript> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.termination.transcript.as_ref())
    }

    pub fn last_reason(&self) -> Option<TerminationReason> {
        self.attempts.last().map(|a| a.termination.reason)
    }
}

enum Wake {
    Stop,
    Timeout,
    Event(Option<Result<RecognitionEvent, FailureKind>>),
}

pub struct SessionRunner {
    factory: Arc<dyn ListenerFactory>,
    sink: Arc<dyn TranscriptSink>,
    events: EventSender,
    session_timeout: Duration,
    next_id: AtomicU64,
}

impl SessionRunner {
    pub fn new(
        factory: Arc<dyn ListenerFactory>,
        sink: Arc<dyn TranscriptSink>,
        events: EventSender,
        session_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            sink,
            events,
            session_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `strategy`, falling back to the simulation when it errors.
    ///
    /// `stop` flips to `true` when the user asks to stop listening.
    pub async fn run(&self, strategy: Strategy, stop: &mut watch::Receiver<bool>) -> SessionReport {
        let first = self.run_once(strategy, stop).await;
        let fallback = first.termination.wants_fallback(strategy) && !*stop.borrow();
        let mut report = SessionReport {
            attempts: vec![first],
        };

        if fallback {
            info!(from = %strategy, "Falling back to simulated voice input");
            report.attempts.push(self.run_once(Strategy::Simulated, stop).await);
        }
        report
    }

    async fn run_once(&self, strategy: Strategy, stop: &mut watch::Receiver<bool>) -> Attempt {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut session = ListeningSession::new(session_id, strategy);
        info!(session = session_id, strategy = %strategy, "Starting listening session");
        self.emit(VoiceEvent::StrategySelected(strategy));
        self.advance(&mut session, SessionInput::Start);

        let opened = tokio::select! {
            biased;
            _ = stop_requested(stop) => None,
            opened = self.factory.open(strategy, session_id) => Some(opened),
        };

        let mut listener = match opened {
            None => {
                self.advance(&mut session, SessionInput::Stop { flushed: None });
                None
            }
            Some(Err(kind)) => {
                self.advance(&mut session, SessionInput::AcquireFailed(kind));
                None
            }
            Some(Ok(listener)) => {
                debug_assert_eq!(listener.strategy(), strategy);
                self.advance(&mut session, SessionInput::Acquired);
                Some(listener)
            }
        };

        if let Some(listener) = listener.as_mut() {
            self.listen(&mut session, listener.as_mut(), stop).await;
            listener.release();
        }

        self.finish(session)
    }

    /// Feeds the session until it terminates. Returns with the listener no
    /// longer polled and the timeout dropped.
    async fn listen(
        &self,
        session: &mut ListeningSession,
        listener: &mut dyn Listener,
        stop: &mut watch::Receiver<bool>,
    ) {
        let deadline = Instant::now() + self.session_timeout;
        loop {
            let wake = tokio::select! {
                biased;
                _ = stop_requested(stop) => Wake::Stop,
                _ = sleep_until(deadline) => Wake::Timeout,
                event = listener.next_event() => Wake::Event(event),
            };

            let input = match wake {
                Wake::Stop => SessionInput::Stop {
                    flushed: flush(listener).await,
                },
                Wake::Timeout => {
                    debug!(session = session.id(), timeout = ?self.session_timeout, "Session timed out");
                    SessionInput::Timeout {
                        flushed: flush(listener).await,
                    }
                }
                Wake::Event(Some(Ok(event))) => SessionInput::Recognition(event),
                Wake::Event(Some(Err(kind))) => SessionInput::RecognitionFailed(kind),
                Wake::Event(None) => SessionInput::StreamEnded,
            };

            if let Step::Terminated(_) = self.advance(session, input) {
                return;
            }
        }
    }

    /// Delivers the outcome and returns the session to Idle. Resources are
    /// already released at this point.
    fn finish(&self, mut session: ListeningSession) -> Attempt {
        let termination = match session.termination() {
            Some(termination) => termination.clone(),
            None => {
                warn!(session = session.id(), "Session ended without termination");
                Termination {
                    reason: TerminationReason::Error(FailureKind::Device),
                    transcript: None,
                }
            }
        };

        if let Some(message) = termination.reason.message() {
            self.emit(VoiceEvent::Error(message.to_string()));
        }
        if let Some(transcript) = &termination.transcript {
            info!(session = session.id(), transcript = %transcript, "Transcript ready");
            self.emit(VoiceEvent::Transcript(transcript.clone()));
            self.sink.on_transcript(transcript.clone());
        }

        self.advance(&mut session, SessionInput::Released);
        debug_assert!(session.phase() == SessionPhase::Idle);

        Attempt {
            session_id: session.id(),
            strategy: session.strategy(),
            termination,
        }
    }

    fn advance(&self, session: &mut ListeningSession, input: SessionInput) -> Step {
        let before = session.phase();
        let step = session.dispatch(input);
        if session.phase() != before {
            self.emit(VoiceEvent::PhaseChanged(session.phase()));
        }
        if let Step::PartialUpdated(text) = &step {
            self.emit(VoiceEvent::Partial(text.clone()));
        }
        step
    }

    fn emit(&self, event: VoiceEvent) {
        // Nobody listening is fine.
        self.events.send(event).ok();
    }
}

/// Collects the listener's pending text, giving up after [`FLUSH_LIMIT`].
async fn flush(listener: &mut dyn Listener) -> Option<String> {
    match tokio::time::timeout(FLUSH_LIMIT, listener.flush()).await {
        Ok(text) => text,
        Err(_) => {
            warn!(strategy = %listener.strategy(), "Listener did not flush in time");
            None
        }
    }
}

/// Resolves once a stop is requested. Never resolves if the requester is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tara_core::ResultKind;
    use tokio::sync::mpsc;

    use super::*;
    use crate::listener::{SimulatedListener, SimulationConfig};

    /// One scripted listener step: wait, then yield.
    type Script = Vec<(u64, Option<Result<RecognitionEvent, FailureKind>>)>;

    struct ScriptedListener {
        strategy: Strategy,
        script: VecDeque<(u64, Option<Result<RecognitionEvent, FailureKind>>)>,
        flushed: Option<String>,
        flush_delay: Duration,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Listener for ScriptedListener {
        fn strategy(&self) -> Strategy {
            self.strategy
        }

        async fn next_event(&mut self) -> Option<Result<RecognitionEvent, FailureKind>> {
            let Some((delay_ms, _)) = self.script.front() else {
                return std::future::pending().await;
            };
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            self.script.pop_front().and_then(|(_, event)| event)
        }

        async fn flush(&mut self) -> Option<String> {
            tokio::time::sleep(self.flush_delay).await;
            self.flushed.take()
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Opens scripted listeners for model/native, a fast simulation
    /// otherwise, and records what it opened.
    #[derive(Default)]
    struct FakeFactory {
        scripts: Mutex<VecDeque<Result<Script, FailureKind>>>,
        flushed: Option<String>,
        flush_delay: Duration,
        acquire_delay: Duration,
        opened: Mutex<Vec<Strategy>>,
        released: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn with(scripts: Vec<Result<Script, FailureKind>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ListenerFactory for FakeFactory {
        async fn open(&self, strategy: Strategy, session_id: u64) -> Result<Box<dyn Listener>, FailureKind> {
            self.opened.lock().push(strategy);
            tokio::time::sleep(self.acquire_delay).await;
            if strategy == Strategy::Simulated {
                let timing = SimulationConfig {
                    tick: Duration::from_millis(100),
                    pause: Duration::from_millis(200),
                };
                return Ok(Box::new(SimulatedListener::for_session(session_id, timing)));
            }
            let script = self.scripts.lock().pop_front().unwrap_or(Ok(Vec::new()))?;
            Ok(Box::new(ScriptedListener {
                strategy,
                script: script.into(),
                flushed: self.flushed.clone(),
                flush_delay: self.flush_delay,
                released: self.released.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
    }

    impl TranscriptSink for RecordingSink {
        fn on_transcript(&self, transcript: Transcript) {
            self.received.lock().push(transcript.into_string());
        }
    }

    struct Harness {
        runner: SessionRunner,
        factory: Arc<FakeFactory>,
        sink: Arc<RecordingSink>,
        events: mpsc::UnboundedReceiver<VoiceEvent>,
    }

    fn harness(factory: FakeFactory) -> Harness {
        let factory = Arc::new(factory);
        let sink = Arc::new(RecordingSink::default());
        let (tx, events) = mpsc::unbounded_channel();
        let runner = SessionRunner::new(factory.clone(), sink.clone(), tx, Duration::from_secs(10));
        Harness {
            runner,
            factory,
            sink,
            events,
        }
    }

    fn partial(text: &str) -> Option<Result<RecognitionEvent, FailureKind>> {
        Some(Ok(RecognitionEvent::Partial(text.to_string())))
    }

    fn final_result(text: &str) -> Option<Result<RecognitionEvent, FailureKind>> {
        Some(Ok(RecognitionEvent::Final(text.to_string())))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<VoiceEvent>) -> Vec<VoiceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_final_result_scenario() {
        let mut h = harness(FakeFactory::with(vec![Ok(vec![
            (500, partial("Book")),
            (500, partial("Book a")),
            (2000, final_result("Book a session")),
        ])]));
        let (_stop_tx, mut stop) = watch::channel(false);

        let report = h.runner.run(Strategy::Native, &mut stop).await;

        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.last_reason(), Some(TerminationReason::FinalResult));
        assert_eq!(report.transcript().map(Transcript::as_str), Some("Book a session"));
        assert_eq!(*h.sink.received.lock(), vec!["Book a session".to_string()]);
        assert_eq!(h.factory.released.load(Ordering::SeqCst), 1);

        let events = drain(&mut h.events);
        assert_eq!(events[0], VoiceEvent::StrategySelected(Strategy::Native));
        assert!(events.contains(&VoiceEvent::Partial("Book a".to_string())));
        assert_eq!(events.last(), Some(&VoiceEvent::PhaseChanged(SessionPhase::Idle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_content_uses_last_partial() {
        let h = harness(FakeFactory::with(vec![Ok(vec![
            (9_900, partial("I need a refund")),
            // Would arrive after the timeout.
            (500, final_result("I need a refund please")),
        ])]));
        let (_stop_tx, mut stop) = watch::channel(false);
        let start = Instant::now();

        let report = h.runner.run(Strategy::Model, &mut stop).await;

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(report.last_reason(), Some(TerminationReason::TimeoutWithContent));
        assert_eq!(*h.sink.received.lock(), vec!["I need a refund".to_string()]);
        assert_eq!(h.factory.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_empty() {
        let mut h = harness(FakeFactory::with(vec![Ok(vec![(20_000, final_result("late"))])]));
        let (_stop_tx, mut stop) = watch::channel(false);

        let report = h.runner.run(Strategy::Model, &mut stop).await;

        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.last_reason(), Some(TerminationReason::TimeoutEmpty));
        assert!(h.sink.received.lock().is_empty());
        assert!(drain(&mut h.events).contains(&VoiceEvent::Error("Nothing heard, try again.".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_falls_back_to_simulation() {
        let mut h = harness(FakeFactory::with(vec![Err(FailureKind::PermissionDenied)]));
        let (_stop_tx, mut stop) = watch::channel(false);

        let report = h.runner.run(Strategy::Native, &mut stop).await;

        assert_eq!(report.attempts.len(), 2);
        assert_eq!(
            report.attempts[0].termination.reason,
            TerminationReason::Error(FailureKind::PermissionDenied)
        );
        assert_eq!(report.attempts[1].strategy, Strategy::Simulated);
        assert_eq!(report.last_reason(), Some(TerminationReason::FinalResult));
        assert_eq!(*h.factory.opened.lock(), vec![Strategy::Native, Strategy::Simulated]);
        assert_eq!(h.sink.received.lock().len(), 1);

        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::Error(message) if message.contains("allow microphone access")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_error_falls_back_without_retry() {
        let h = harness(FakeFactory::with(vec![
            Ok(vec![(100, partial("Book")), (100, Some(Err(FailureKind::Recognition)))]),
            Ok(vec![(100, final_result("never used"))]),
        ]));
        let (_stop_tx, mut stop) = watch::channel(false);

        let report = h.runner.run(Strategy::Model, &mut stop).await;

        assert_eq!(*h.factory.opened.lock(), vec![Strategy::Model, Strategy::Simulated]);
        assert!(report.attempts[0].termination.transcript.is_none());
        assert_eq!(h.factory.released.load(Ordering::SeqCst), 1);
        assert_eq!(h.sink.received.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_partial_is_skipped() {
        let h = harness(FakeFactory::with(vec![Ok(vec![
            (100, partial("Cancel")),
            (100, Some(Ok(RecognitionEvent::Malformed(ResultKind::Partial)))),
            (100, final_result("Cancel my booking")),
        ])]));
        let (_stop_tx, mut stop) = watch::channel(false);

        let report = h.runner.run(Strategy::Native, &mut stop).await;
        assert_eq!(report.last_reason(), Some(TerminationReason::FinalResult));
        assert_eq!(report.transcript().map(Transcript::as_str), Some("Cancel my booking"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_falls_back() {
        let h = harness(FakeFactory::with(vec![Ok(vec![(100, None)])]));
        let (_stop_tx, mut stop) = watch::channel(false);

        let report = h.runner.run(Strategy::Native, &mut stop).await;
        assert_eq!(
            report.attempts[0].termination.reason,
            TerminationReason::Error(FailureKind::Device)
        );
        assert_eq!(report.attempts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_stop_keeps_content_and_releases() {
        let mut factory = FakeFactory::with(vec![Ok(vec![
            (300, partial("Book a")),
            (60_000, final_result("never")),
        ])]);
        factory.flushed = Some("Book a table".to_string());
        let h = harness(factory);
        let (stop_tx, mut stop) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop_tx.send(true).ok();
            // Keep the sender alive past the session.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let start = Instant::now();
        let report = h.runner.run(Strategy::Model, &mut stop).await;

        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.last_reason(), Some(TerminationReason::UserStopped));
        assert_eq!(*h.sink.received.lock(), vec!["Book a table".to_string()]);
        assert_eq!(h.factory.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_flush_falls_back_to_last_partial() {
        let mut factory = FakeFactory::with(vec![Ok(vec![
            (300, partial("Book a")),
            (60_000, final_result("never")),
        ])]);
        factory.flushed = Some("Book a table".to_string());
        factory.flush_delay = Duration::from_secs(30);
        let h = harness(factory);
        let (stop_tx, mut stop) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop_tx.send(true).ok();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let start = Instant::now();
        let report = h.runner.run(Strategy::Model, &mut stop).await;

        assert_eq!(start.elapsed(), Duration::from_secs(1) + FLUSH_LIMIT);
        assert_eq!(report.last_reason(), Some(TerminationReason::UserStopped));
        assert_eq!(*h.sink.received.lock(), vec!["Book a".to_string()]);
        assert_eq!(h.factory.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_acquiring_skips_fallback() {
        let mut factory = FakeFactory::with(vec![Err(FailureKind::PermissionDenied)]);
        factory.acquire_delay = Duration::from_secs(5);
        let h = harness(factory);
        let (stop_tx, mut stop) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let report = h.runner.run(Strategy::Native, &mut stop).await;

        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.last_reason(), Some(TerminationReason::UserStopped));
        assert!(h.sink.received.lock().is_empty());
        assert_eq!(h.factory.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_completes_within_bound() {
        let h = harness(FakeFactory::default());
        let (_stop_tx, mut stop) = watch::channel(false);
        let start = Instant::now();

        let report = h.runner.run(Strategy::Simulated, &mut stop).await;

        let bound = SimulatedListener::for_session(
            0,
            SimulationConfig {
                tick: Duration::from_millis(100),
                pause: Duration::from_millis(200),
            },
        )
        .duration();
        assert!(start.elapsed() <= bound);
        assert_eq!(report.last_reason(), Some(TerminationReason::FinalResult));
        assert_eq!(h.sink.received.lock().len(), 1);
    }
}
