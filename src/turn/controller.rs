//! # Turn Controller
//!
//! A single-threaded state machine. Every transition happens inside one of
//! its event methods (`on_partial`, `on_output_complete`, `on_tick`,
//! `resume`, ...), so the owner only has to serialize calls; no locking is
//! involved.
//!
//! ## Finalization policy while listening:
//! Entering `UserListening` and every partial result arm two timers:
//! - **short** (default 4.5s): fires only with a non-empty buffer and sends it
//! - **long** (default 10s): fires only with an empty buffer and stops
//!   listening until the user taps to continue
//!
//! Whichever fires first under its own condition wins; finalizing cancels
//! the other, so a turn is sent at most once.
//!
//! ## Outputs:
//! Everything the owner must act on is emitted as a [`TurnEvent`] on an
//! unbounded channel, including the [`TurnRequest`] to forward to the
//! turn-exchange backend. The reply is fed back through [`TurnController::on_reply`].

use crate::turn::capture::{CaptureStrategy, InputCapture};
use crate::turn::clock::Clock;
use crate::turn::error::{CaptureError, TurnError};
use crate::turn::output::OutputDelivery;
use crate::turn::state::{ContinueReason, RequestId, SpeakingPhase, TurnState, UtteranceBuffer};
use crate::turn::timer::{TimerKind, Timers};
use crate::turn::TurnConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Text the front-end sends to ask the assistant to open a conversation.
pub const GREETING_SENTINEL: &str = "__init__";

/// Payload of one turn sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnMessage {
    /// Ask the assistant to open an empty session
    Greeting,
    /// A finalized user utterance
    User(String),
}

impl TurnMessage {
    /// Wire form understood by the turn-exchange endpoints.
    pub fn as_wire(&self) -> &str {
        match self {
            TurnMessage::Greeting => GREETING_SENTINEL,
            TurnMessage::User(text) => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub id: RequestId,
    pub session_id: String,
    pub message: TurnMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    UserEnded,
    CallLimit,
    ModeSwitch,
    Disconnected,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserEnded => "user_ended",
            EndReason::CallLimit => "call_limit",
            EndReason::ModeSwitch => "mode_switch",
            EndReason::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StateChanged(TurnState),
    /// Live transcript of the user turn in progress
    Partial(String),
    /// Forward this to the backend and report back with `on_reply`
    RequestTurn(TurnRequest),
    Error(TurnError),
    Ended(EndReason),
}

pub struct TurnController {
    session_id: String,
    config: TurnConfig,
    strategy: CaptureStrategy,
    clock: Arc<dyn Clock>,
    capture: Box<dyn InputCapture>,
    output: Box<dyn OutputDelivery>,
    events: mpsc::UnboundedSender<TurnEvent>,
    state: TurnState,
    buffer: UtteranceBuffer,
    timers: Timers,
    next_request: u64,
    /// Message of the request currently in flight
    pending: Option<TurnMessage>,
    /// Message of the last request that failed, kept for `retry`
    failed: Option<TurnMessage>,
    capturing: bool,
}

impl TurnController {
    pub fn new(
        session_id: impl Into<String>,
        config: TurnConfig,
        strategy: CaptureStrategy,
        clock: Arc<dyn Clock>,
        capture: Box<dyn InputCapture>,
        output: Box<dyn OutputDelivery>,
        events: mpsc::UnboundedSender<TurnEvent>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            strategy,
            clock,
            capture,
            output,
            events,
            state: TurnState::Idle,
            buffer: UtteranceBuffer::default(),
            timers: Timers::new(),
            next_request: 1,
            pending: None,
            failed: None,
            capturing: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn strategy(&self) -> CaptureStrategy {
        self.strategy
    }

    pub fn buffered_text(&self) -> &str {
        self.buffer.text()
    }

    /// Earliest pending timer deadline; the owner must call
    /// [`on_tick`](Self::on_tick) at or after it.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn has_pending_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Begin a call. A session without history asks the assistant to speak
    /// first; otherwise the user gets the floor.
    pub fn start(&mut self, has_history: bool) {
        if self.state != TurnState::Idle {
            warn!(session_id = %self.session_id, state = self.state.as_str(), "Call already started");
            return;
        }

        info!(
            session_id = %self.session_id,
            strategy = self.strategy.as_str(),
            has_history,
            "Starting call"
        );

        if let Some(limit) = self.config.call_limit {
            self.timers.schedule(TimerKind::CallLimit, self.clock.now() + limit);
        }

        if has_history {
            self.listen_or_wait();
        } else {
            self.send(TurnMessage::Greeting);
        }
    }

    /// A partial transcription arrived from the capture device.
    pub fn on_partial(&mut self, text: &str) {
        if self.state != TurnState::UserListening {
            debug!(state = self.state.as_str(), "Ignoring partial result outside listening");
            return;
        }

        self.buffer.replace(text);
        if !self.buffer.is_empty() {
            self.emit(TurnEvent::Partial(self.buffer.text().to_string()));
        }
        self.arm_silence_timers();
    }

    /// The capture device closed the utterance itself (e.g. push-to-talk stop).
    pub fn on_capture_final(&mut self, text: &str) {
        if self.state != TurnState::UserListening {
            debug!(state = self.state.as_str(), "Ignoring capture finalization outside listening");
            return;
        }

        if !text.trim().is_empty() {
            self.buffer.replace(text);
        }

        if self.buffer.is_empty() {
            self.discard_empty();
            self.stop_capture();
            self.listen_or_wait();
            return;
        }

        let text = self.buffer.take();
        self.finalize(text);
    }

    /// Capture could not start or broke down while listening.
    pub fn on_capture_error(&mut self, err: CaptureError) {
        if self.state != TurnState::UserListening {
            debug!(error = %err, "Ignoring capture error outside listening");
            return;
        }
        self.capture_failed(err);
    }

    /// Text submitted by hand: chat input, or the manual fallback when
    /// speech capture is unavailable.
    pub fn submit_text(&mut self, text: &str) {
        match self.state {
            TurnState::UserListening | TurnState::AwaitingContinue(_) => {}
            _ => {
                debug!(state = self.state.as_str(), "Ignoring submitted text");
                return;
            }
        }

        let text = text.trim();
        if text.is_empty() {
            self.discard_empty();
            return;
        }
        self.finalize(text.to_string());
    }

    /// Output finished (end-of-speech callback).
    pub fn on_output_complete(&mut self) {
        if self.state != TurnState::AssistantSpeaking(SpeakingPhase::Delivering) {
            debug!(state = self.state.as_str(), "Ignoring output completion");
            return;
        }
        self.listen_or_wait();
    }

    /// The backend answered request `id`.
    pub fn on_reply(&mut self, id: RequestId, result: Result<String, TurnError>) {
        if self.state.in_flight() != Some(id) {
            debug!(request_id = id.0, state = self.state.as_str(), "Dropping stale reply");
            return;
        }
        let message = self.pending.take();

        match result {
            Ok(reply) => {
                let reply = reply.trim();
                if reply.is_empty() {
                    debug!(request_id = id.0, "Empty reply, handing the floor back");
                    self.listen_or_wait();
                    return;
                }

                self.set_state(TurnState::AssistantSpeaking(SpeakingPhase::Delivering));
                match self.output.deliver(reply) {
                    Ok(()) if self.output.completes_immediately() => self.on_output_complete(),
                    Ok(()) => {}
                    Err(err) => {
                        warn!(error = %err, "Output delivery failed, treating as complete");
                        self.on_output_complete();
                    }
                }
            }
            Err(err) => {
                warn!(request_id = id.0, error = %err, "Turn exchange failed");
                self.failed = message;
                self.emit(TurnEvent::Error(err));
                self.set_state(TurnState::AwaitingContinue(ContinueReason::RequestFailed));
            }
        }
    }

    /// User gesture: resume input capture after a pause.
    pub fn resume(&mut self) {
        match self.state {
            TurnState::AwaitingContinue(reason) => {
                debug!(reason = reason.as_str(), "Resuming input");
                self.enter_listening();
            }
            _ => debug!(state = self.state.as_str(), "Nothing to resume"),
        }
    }

    /// User gesture: resend the turn that failed.
    pub fn retry(&mut self) {
        if self.state != TurnState::AwaitingContinue(ContinueReason::RequestFailed) {
            debug!(state = self.state.as_str(), "Nothing to retry");
            return;
        }
        match self.failed.take() {
            Some(message) => self.send(message),
            None => self.enter_listening(),
        }
    }

    /// Process every timer that is due at the clock's current instant.
    pub fn on_tick(&mut self) {
        let now = self.clock.now();
        for kind in self.timers.take_expired(now) {
            debug!(session_id = %self.session_id, timer = kind.as_str(), "Timer fired");
            match kind {
                TimerKind::ShortSilence => {
                    if self.state == TurnState::UserListening && !self.buffer.is_empty() {
                        debug!("Short silence elapsed, finalizing turn");
                        let text = self.buffer.take();
                        self.finalize(text);
                    }
                }
                TimerKind::LongSilence => {
                    if self.state == TurnState::UserListening && self.buffer.is_empty() {
                        info!(session_id = %self.session_id, "Long silence, waiting for user to continue");
                        self.timers.cancel(TimerKind::ShortSilence);
                        self.stop_capture();
                        self.set_state(TurnState::AwaitingContinue(ContinueReason::LongSilence));
                    }
                }
                TimerKind::CallLimit => {
                    info!(session_id = %self.session_id, "Call time limit reached");
                    self.end(EndReason::CallLimit);
                }
            }
        }
    }

    /// Switch capture strategy. The call in progress is ended first.
    pub fn switch_strategy(&mut self, strategy: CaptureStrategy) {
        if strategy == self.strategy {
            return;
        }
        self.end(EndReason::ModeSwitch);
        self.strategy = strategy;
    }

    /// End the call: cancel every timer, abort capture and output, and
    /// forget any request in flight so a late reply is dropped.
    pub fn end(&mut self, reason: EndReason) {
        if self.state == TurnState::Idle && self.timers.is_empty() && !self.capturing {
            return;
        }

        info!(session_id = %self.session_id, reason = reason.as_str(), "Ending call");
        self.timers.cancel_all();
        self.stop_capture();
        self.output.cancel();
        self.buffer.reset();
        self.pending = None;
        self.failed = None;
        self.set_state(TurnState::Idle);
        self.emit(TurnEvent::Ended(reason));
    }

    fn listen_or_wait(&mut self) {
        if self.strategy.begins_automatically() {
            self.enter_listening();
        } else {
            self.set_state(TurnState::AwaitingContinue(ContinueReason::TapToSpeak));
        }
    }

    fn enter_listening(&mut self) {
        self.buffer.reset();

        if self.strategy != CaptureStrategy::Typed {
            if let Err(err) = self.capture.begin() {
                self.capture_failed(err);
                return;
            }
            self.capturing = true;
        }

        self.set_state(TurnState::UserListening);
        self.arm_silence_timers();
    }

    fn arm_silence_timers(&mut self) {
        if !self.strategy.uses_silence_timers() {
            return;
        }
        let now = self.clock.now();
        self.timers.schedule(TimerKind::ShortSilence, now + self.config.short_silence);
        self.timers.schedule(TimerKind::LongSilence, now + self.config.long_silence);
    }

    fn cancel_silence_timers(&mut self) {
        self.timers.cancel(TimerKind::ShortSilence);
        self.timers.cancel(TimerKind::LongSilence);
    }

    fn stop_capture(&mut self) {
        if self.capturing {
            self.capture.cancel();
            self.capturing = false;
        }
    }

    fn capture_failed(&mut self, err: CaptureError) {
        warn!(session_id = %self.session_id, error = %err, "Input capture unavailable");
        self.cancel_silence_timers();
        self.stop_capture();
        self.buffer.reset();
        self.emit(TurnEvent::Error(TurnError::InputUnavailable(err)));
        self.set_state(TurnState::AwaitingContinue(ContinueReason::CaptureUnavailable));
    }

    fn discard_empty(&mut self) {
        debug!(session_id = %self.session_id, error = %TurnError::EmptyCapture, "Discarding turn");
    }

    fn finalize(&mut self, text: String) {
        if let Some(id) = self.state.in_flight() {
            warn!(request_id = id.0, "Turn already in flight, not sending another");
            return;
        }

        self.cancel_silence_timers();
        self.stop_capture();
        self.buffer.reset();
        self.failed = None;
        self.send(TurnMessage::User(text));
    }

    fn send(&mut self, message: TurnMessage) {
        let id = RequestId(self.next_request);
        self.next_request += 1;

        let request = TurnRequest {
            id,
            session_id: self.session_id.clone(),
            message: message.clone(),
        };
        self.pending = Some(message);
        self.set_state(TurnState::AssistantSpeaking(SpeakingPhase::AwaitingReply(id)));
        self.emit(TurnEvent::RequestTurn(request));
    }

    fn set_state(&mut self, next: TurnState) {
        if self.state == next {
            return;
        }
        debug!(
            session_id = %self.session_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Turn state change"
        );
        self.state = next;
        self.emit(TurnEvent::StateChanged(next));
    }

    fn emit(&self, event: TurnEvent) {
        if self.events.send(event).is_err() {
            debug!(session_id = %self.session_id, "Turn event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::clock::ManualClock;
    use crate::turn::testing::{FakeCapture, FakeOutput, Log};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        controller: TurnController,
        clock: ManualClock,
        events: mpsc::UnboundedReceiver<TurnEvent>,
        capture_log: Log,
        output_log: Log,
        capture_failure: Arc<Mutex<Option<CaptureError>>>,
    }

    impl Harness {
        fn new(strategy: CaptureStrategy) -> Self {
            Self::with_config(strategy, TurnConfig::default())
        }

        fn with_config(strategy: CaptureStrategy, config: TurnConfig) -> Self {
            let clock = ManualClock::new();
            let (tx, rx) = mpsc::unbounded_channel();
            let capture_log = Log::default();
            let output_log = Log::default();
            let capture_failure = Arc::new(Mutex::new(None));

            let controller = TurnController::new(
                "session-1",
                config,
                strategy,
                Arc::new(clock.clone()),
                Box::new(FakeCapture {
                    log: capture_log.clone(),
                    fail_with: capture_failure.clone(),
                }),
                Box::new(FakeOutput {
                    log: output_log.clone(),
                    immediate: strategy == CaptureStrategy::Typed,
                }),
                tx,
            );

            Self {
                controller,
                clock,
                events: rx,
                capture_log,
                output_log,
                capture_failure,
            }
        }

        /// Advance virtual time in 100ms steps, ticking the controller like
        /// a real timer would.
        fn advance(&mut self, by: Duration) {
            let step = Duration::from_millis(100);
            let mut remaining = by;
            while remaining > Duration::ZERO {
                let delta = remaining.min(step);
                self.clock.advance(delta);
                remaining -= delta;
                self.controller.on_tick();
            }
        }

        fn drain(&mut self) -> Vec<TurnEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn requests(events: &[TurnEvent]) -> Vec<TurnRequest> {
            events
                .iter()
                .filter_map(|e| match e {
                    TurnEvent::RequestTurn(r) => Some(r.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Start on a session with history and discard the start events.
        fn listening(strategy: CaptureStrategy) -> Self {
            let mut h = Self::new(strategy);
            h.controller.start(true);
            h.drain();
            h
        }
    }

    #[test]
    fn scenario_two_partials_then_silence_sends_once() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);

        h.controller.on_partial("hello");
        h.advance(Duration::from_secs(1));
        h.controller.on_partial("hello there");
        h.advance(Duration::from_millis(4500));

        let events = h.drain();
        let requests = Harness::requests(&events);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, TurnMessage::User("hello there".to_string()));
        assert_eq!(requests[0].session_id, "session-1");

        // Nothing else goes out however long the silence lasts.
        h.advance(Duration::from_secs(30));
        assert!(Harness::requests(&h.drain()).is_empty());
        assert_eq!(h.clock.elapsed(), Duration::from_millis(35_500));
    }

    #[test]
    fn partial_before_threshold_restarts_short_timer() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);

        h.controller.on_partial("I feel");
        h.advance(Duration::from_secs(4));
        h.controller.on_partial("I feel tired");
        h.advance(Duration::from_secs(4));

        assert!(Harness::requests(&h.drain()).is_empty());
        assert_eq!(h.controller.state(), TurnState::UserListening);

        h.advance(Duration::from_millis(500));
        let requests = Harness::requests(&h.drain());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message.as_wire(), "I feel tired");
    }

    #[test]
    fn long_silence_waits_for_continue_without_backend_call() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);

        h.advance(Duration::from_secs(10));

        let events = h.drain();
        assert!(Harness::requests(&events).is_empty());
        assert_eq!(
            h.controller.state(),
            TurnState::AwaitingContinue(ContinueReason::LongSilence)
        );
        assert_eq!(h.capture_log.count("cancel"), 1);
        assert!(!h.controller.has_pending_timers());
    }

    #[test]
    fn whitespace_partials_never_finalize() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);

        h.controller.on_partial("   ");
        h.advance(Duration::from_secs(6));
        h.controller.on_partial("");
        h.advance(Duration::from_secs(10));

        assert!(Harness::requests(&h.drain()).is_empty());
        assert_eq!(
            h.controller.state(),
            TurnState::AwaitingContinue(ContinueReason::LongSilence)
        );
    }

    #[test]
    fn continue_gesture_resumes_listening() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.advance(Duration::from_secs(10));

        h.controller.resume();

        assert_eq!(h.controller.state(), TurnState::UserListening);
        assert_eq!(h.capture_log.count("begin"), 2);
        h.controller.on_partial("sorry, I was thinking");
        h.advance(Duration::from_millis(4500));
        assert_eq!(Harness::requests(&h.drain()).len(), 1);
    }

    #[test]
    fn ending_the_call_cancels_everything() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.controller.on_partial("half a sentence");

        h.controller.end(EndReason::UserEnded);
        assert!(!h.controller.has_pending_timers());
        assert_eq!(h.controller.next_deadline(), None);
        let events = h.drain();
        assert!(events.contains(&TurnEvent::Ended(EndReason::UserEnded)));

        h.advance(Duration::from_secs(60));
        assert!(h.drain().is_empty());
        assert_eq!(h.controller.state(), TurnState::Idle);
        assert_eq!(h.output_log.count("cancel_output"), 1);
    }

    #[test]
    fn late_reply_after_end_is_dropped() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.controller.on_partial("are you there");
        h.advance(Duration::from_millis(4500));
        let id = Harness::requests(&h.drain())[0].id;

        h.controller.end(EndReason::UserEnded);
        h.controller.on_reply(id, Ok("I am here".to_string()));

        assert_eq!(h.controller.state(), TurnState::Idle);
        assert!(h.output_log.entries().iter().all(|e| !e.starts_with("deliver")));
    }

    #[test]
    fn backend_failure_is_recoverable() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.controller.on_partial("hello");
        h.advance(Duration::from_millis(4500));
        let first = Harness::requests(&h.drain())[0].clone();

        h.controller
            .on_reply(first.id, Err(TurnError::NetworkFailure("503".to_string())));
        assert_eq!(
            h.controller.state(),
            TurnState::AwaitingContinue(ContinueReason::RequestFailed)
        );
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, TurnEvent::Error(TurnError::NetworkFailure(_)))));

        h.controller.retry();
        let retried = Harness::requests(&h.drain());
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].message, first.message);
        assert_ne!(retried[0].id, first.id);

        h.controller.on_reply(retried[0].id, Ok("Hi, how are you?".to_string()));
        h.controller.on_output_complete();
        assert_eq!(h.controller.state(), TurnState::UserListening);
    }

    #[test]
    fn resume_after_failure_starts_a_new_turn() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.controller.on_partial("hello");
        h.advance(Duration::from_millis(4500));
        let id = Harness::requests(&h.drain())[0].id;
        h.controller.on_reply(id, Err(TurnError::NetworkFailure("timeout".to_string())));

        h.controller.resume();
        h.controller.on_partial("let me try again");
        h.advance(Duration::from_millis(4500));

        let requests = Harness::requests(&h.drain());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message.as_wire(), "let me try again");
    }

    #[test]
    fn empty_session_starts_with_greeting() {
        let mut h = Harness::new(CaptureStrategy::Continuous);
        h.controller.start(false);

        let requests = Harness::requests(&h.drain());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, TurnMessage::Greeting);
        assert_eq!(requests[0].message.as_wire(), GREETING_SENTINEL);

        h.controller.on_reply(requests[0].id, Ok("Welcome. What's on your mind?".to_string()));
        assert_eq!(
            h.controller.state(),
            TurnState::AssistantSpeaking(SpeakingPhase::Delivering)
        );
        assert_eq!(h.capture_log.count("begin"), 0);

        h.controller.on_output_complete();
        assert_eq!(h.controller.state(), TurnState::UserListening);
        assert_eq!(h.capture_log.count("begin"), 1);
    }

    #[test]
    fn partials_while_assistant_speaks_are_ignored() {
        let mut h = Harness::new(CaptureStrategy::Continuous);
        h.controller.start(false);
        let id = Harness::requests(&h.drain())[0].id;
        h.controller.on_reply(id, Ok("Hello".to_string()));

        h.controller.on_partial("echo of the assistant");
        h.advance(Duration::from_secs(20));

        assert!(Harness::requests(&h.drain()).is_empty());
        assert_eq!(h.controller.buffered_text(), "");
    }

    #[test]
    fn no_second_request_while_one_is_in_flight() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.controller.on_partial("first");
        h.advance(Duration::from_millis(4500));

        h.controller.on_partial("second");
        h.controller.on_capture_final("second");
        h.controller.submit_text("third");
        h.advance(Duration::from_secs(20));

        assert_eq!(Harness::requests(&h.drain()).len(), 1);
    }

    #[test]
    fn capture_denied_offers_manual_fallback() {
        let mut h = Harness::new(CaptureStrategy::Continuous);
        *h.capture_failure.lock().unwrap() = Some(CaptureError::PermissionDenied);
        h.controller.start(true);

        assert_eq!(
            h.controller.state(),
            TurnState::AwaitingContinue(ContinueReason::CaptureUnavailable)
        );
        assert!(h.drain().iter().any(|e| matches!(
            e,
            TurnEvent::Error(TurnError::InputUnavailable(CaptureError::PermissionDenied))
        )));
        assert!(!h.controller.has_pending_timers());

        h.controller.submit_text("typing instead");
        let requests = Harness::requests(&h.drain());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message.as_wire(), "typing instead");
    }

    #[test]
    fn capture_error_mid_turn_stops_timers() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.controller.on_partial("so today");

        h.controller.on_capture_error(CaptureError::Device("network".to_string()));

        assert_eq!(
            h.controller.state(),
            TurnState::AwaitingContinue(ContinueReason::CaptureUnavailable)
        );
        h.advance(Duration::from_secs(20));
        assert!(Harness::requests(&h.drain()).is_empty());
    }

    #[test]
    fn empty_capture_final_is_discarded() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);

        h.controller.on_capture_final("  ");

        assert!(Harness::requests(&h.drain()).is_empty());
        assert_eq!(h.controller.state(), TurnState::UserListening);
        assert_eq!(h.capture_log.count("begin"), 2);
    }

    #[test]
    fn push_to_talk_waits_for_tap() {
        let mut h = Harness::new(CaptureStrategy::PushToTalk);
        h.controller.start(true);
        assert_eq!(
            h.controller.state(),
            TurnState::AwaitingContinue(ContinueReason::TapToSpeak)
        );
        assert_eq!(h.capture_log.count("begin"), 0);

        h.controller.resume();
        h.controller.on_partial("recorded words");
        h.controller.on_capture_final("recorded words");

        let requests = Harness::requests(&h.drain());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message.as_wire(), "recorded words");
        h.advance(Duration::from_secs(20));
        assert!(Harness::requests(&h.drain()).is_empty());
    }

    #[test]
    fn typed_chat_has_no_silence_timers() {
        let mut h = Harness::listening(CaptureStrategy::Typed);
        assert!(!h.controller.has_pending_timers());
        assert_eq!(h.capture_log.count("begin"), 0);

        h.advance(Duration::from_secs(60));
        assert_eq!(h.controller.state(), TurnState::UserListening);

        h.controller.submit_text("I had a rough week");
        let id = Harness::requests(&h.drain())[0].id;
        h.controller.on_reply(id, Ok("I'm sorry to hear that.".to_string()));

        // Text output completes at once and hands the floor back.
        assert_eq!(h.controller.state(), TurnState::UserListening);
        assert_eq!(h.output_log.count("deliver:I'm sorry to hear that."), 1);
    }

    #[test]
    fn call_limit_ends_the_call() {
        let config = TurnConfig {
            call_limit: Some(Duration::from_secs(300)),
            ..TurnConfig::default()
        };
        let mut h = Harness::with_config(CaptureStrategy::Continuous, config);
        h.controller.start(true);

        for _ in 0..20 {
            h.controller.on_partial("still talking");
            h.advance(Duration::from_secs(4));
        }
        assert_eq!(h.controller.state(), TurnState::UserListening);

        h.advance(Duration::from_secs(300));
        let events = h.drain();
        assert!(events.contains(&TurnEvent::Ended(EndReason::CallLimit)));
        assert_eq!(h.controller.state(), TurnState::Idle);
        assert!(!h.controller.has_pending_timers());
    }

    #[test]
    fn switching_strategy_cancels_pending_timers() {
        let mut h = Harness::listening(CaptureStrategy::Continuous);
        h.controller.on_partial("hello");

        h.controller.switch_strategy(CaptureStrategy::Typed);

        assert_eq!(h.controller.strategy(), CaptureStrategy::Typed);
        assert_eq!(h.controller.state(), TurnState::Idle);
        h.advance(Duration::from_secs(20));
        assert!(Harness::requests(&h.drain()).is_empty());
    }

    #[test]
    fn randomized_partial_sequences_send_at_most_once_per_turn() {
        // Deterministic pseudo-random gaps between partials.
        let mut seed: u64 = 0x5eed;
        for _ in 0..50 {
            let mut h = Harness::listening(CaptureStrategy::Continuous);
            let mut sent = 0;
            for word in 0..12 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let gap_ms = (seed >> 33) % 6000;
                h.controller.on_partial(&format!("word{}", word));
                h.advance(Duration::from_millis(gap_ms));
                sent += Harness::requests(&h.drain()).len();
                if h.controller.state().in_flight().is_some() {
                    break;
                }
            }
            h.advance(Duration::from_secs(15));
            sent += Harness::requests(&h.drain()).len();
            assert_eq!(sent, 1);
        }
    }
}
