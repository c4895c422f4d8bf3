//! # Call WebSocket
//!
//! `GET /ws/call` upgrades to a WebSocket that runs one turn-taking
//! controller for the lifetime of a call. The browser is a thin device: it
//! forwards recognition partials, end-of-speech callbacks and user
//! gestures, and speaks or displays whatever the server tells it to.
//!
//! ## Pieces:
//! - **[`ClientMessage`] / [`ServerMessage`]**: the JSON protocol, tagged by `type`
//! - **[`CallDriver`]**: a controller plus the channels it reports through,
//!   translating its events into protocol messages; no actix involved
//! - **[`CallWebSocket`]**: the actor. It feeds client messages to the driver,
//!   forwards turn requests to the conversation service, and arms one
//!   `run_later` wake-up at the controller's next deadline
//!
//! All controller calls happen on the actor's mailbox, so they are
//! serialized without locks. Replies are tagged with a call generation; a
//! reply that outlives its call is dropped.
//!
//! ## Example exchange:
//! ```text
//! → {"type":"start_call","session_id":"c1","user_id":"u1","capabilities":{"speech_recognition":true}}
//! ← {"type":"call_started","session_id":"c1","strategy":"continuous","remaining_secs":null}
//! ← {"type":"state","state":"awaiting_reply"}
//! ← {"type":"speak","text":"Hello, how are you feeling today?"}
//! → {"type":"output_complete"}
//! ← {"type":"begin_capture"}
//! → {"type":"partial","text":"not great"}
//! ← {"type":"transcript","text":"not great"}
//! ```

use crate::conversation::{ConversationError, TurnReply, TurnTarget};
use crate::error::AppError;
use crate::session::{SessionKind, SessionSettings};
use crate::state::AppState;
use crate::trial::CallStart;
use crate::turn::{
    CaptureError, CaptureStrategy, ClientCapabilities, Clock, ContinueReason, EndReason, InputCapture,
    OutputDelivery, OutputError, RequestId, SystemClock, TurnConfig, TurnController, TurnError, TurnEvent,
    TurnMessage, TurnRequest, TurnState,
};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Body of `start_call`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartCall {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub kind: Option<SessionKind>,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    /// Present for trial calls, which are metered per client
    #[serde(default)]
    pub trial_client_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Messages the browser sends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartCall(StartCall),
    /// Cumulative transcript of the utterance in progress
    Partial { text: String },
    /// The device closed the utterance itself (push-to-talk release)
    CaptureFinal {
        #[serde(default)]
        text: String,
    },
    CaptureError { reason: String },
    OutputComplete,
    /// "Tap to continue" after a pause
    Continue,
    Retry,
    SubmitText { text: String },
    /// Ends the current call; the client starts a new one in the new mode
    SwitchMode { strategy: CaptureStrategy },
    EndCall,
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    CallStarted {
        session_id: String,
        strategy: CaptureStrategy,
        /// Seconds left for a metered trial call
        remaining_secs: Option<u64>,
    },
    State {
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<ContinueReason>,
    },
    BeginCapture,
    CancelCapture,
    Speak { text: String },
    CancelOutput,
    Transcript { text: String },
    TurnSent { text: String },
    SessionRenamed { name: String },
    CallEnded { reason: &'static str },
    Error { code: String, message: String },
    Ping { timestamp: u64 },
}

impl ServerMessage {
    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn state(state: TurnState) -> Self {
        ServerMessage::State {
            state: state.as_str(),
            reason: state.continue_reason(),
        }
    }
}

/// Input capture performed by the browser.
struct RemoteCapture {
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl InputCapture for RemoteCapture {
    fn begin(&mut self) -> Result<(), CaptureError> {
        self.outbox
            .send(ServerMessage::BeginCapture)
            .map_err(|_| CaptureError::Device("connection closed".to_string()))
    }

    fn cancel(&mut self) {
        let _ = self.outbox.send(ServerMessage::CancelCapture);
    }
}

/// Speech synthesis, or plain text display for typed calls.
struct RemoteOutput {
    outbox: mpsc::UnboundedSender<ServerMessage>,
    text_only: bool,
}

impl OutputDelivery for RemoteOutput {
    fn deliver(&mut self, text: &str) -> Result<(), OutputError> {
        self.outbox
            .send(ServerMessage::Speak { text: text.to_string() })
            .map_err(|_| OutputError("connection closed".to_string()))
    }

    fn cancel(&mut self) {
        let _ = self.outbox.send(ServerMessage::CancelOutput);
    }

    fn completes_immediately(&self) -> bool {
        self.text_only
    }
}

/// What one drain of the driver produced.
#[derive(Debug, Default)]
pub struct Drained {
    pub messages: Vec<ServerMessage>,
    pub requests: Vec<TurnRequest>,
    pub ended: Option<EndReason>,
}

/// What a finished exchange did to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Sent under another call; ignored
    Stale,
    Answered { needs_title: bool },
    Failed,
}

/// A controller wired to remote collaborators.
pub struct CallDriver {
    controller: TurnController,
    /// Which call on the connection this driver runs
    generation: u64,
    events: mpsc::UnboundedReceiver<TurnEvent>,
    outbox: mpsc::UnboundedReceiver<ServerMessage>,
}

impl CallDriver {
    pub fn new(
        session_id: &str,
        generation: u64,
        config: TurnConfig,
        strategy: CaptureStrategy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (outbox_tx, outbox) = mpsc::unbounded_channel();

        let controller = TurnController::new(
            session_id,
            config,
            strategy,
            clock,
            Box::new(RemoteCapture {
                outbox: outbox_tx.clone(),
            }),
            Box::new(RemoteOutput {
                outbox: outbox_tx,
                text_only: strategy == CaptureStrategy::Typed,
            }),
            event_tx,
        );

        Self {
            controller,
            generation,
            events,
            outbox,
        }
    }

    pub fn start(&mut self, has_history: bool) {
        self.controller.start(has_history);
    }

    pub fn state(&self) -> TurnState {
        self.controller.state()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.controller.next_deadline()
    }

    /// Time from `now` until the controller next needs [`CallDriver::tick`].
    pub fn wake_delay(&self, now: Instant) -> Option<Duration> {
        self.next_deadline().map(|at| at.saturating_duration_since(now))
    }

    pub fn tick(&mut self) {
        self.controller.on_tick();
    }

    pub fn end(&mut self, reason: EndReason) {
        self.controller.end(reason);
    }

    pub fn on_reply(&mut self, id: RequestId, result: Result<String, TurnError>) {
        self.controller.on_reply(id, result);
    }

    /// Feed the result of an exchange dispatched under `generation`.
    pub fn apply_turn_result(
        &mut self,
        generation: u64,
        id: RequestId,
        result: Result<TurnReply, ConversationError>,
    ) -> ReplyOutcome {
        if generation != self.generation {
            return ReplyOutcome::Stale;
        }

        match result {
            Ok(turn) => {
                self.controller.on_reply(id, Ok(turn.reply));
                ReplyOutcome::Answered {
                    needs_title: turn.needs_title,
                }
            }
            Err(err) => {
                self.controller
                    .on_reply(id, Err(TurnError::NetworkFailure(err.to_string())));
                ReplyOutcome::Failed
            }
        }
    }

    /// Feed one client message to the controller.
    pub fn apply(&mut self, message: ClientMessage) {
        let controller = &mut self.controller;
        match message {
            ClientMessage::Partial { text } => controller.on_partial(&text),
            ClientMessage::CaptureFinal { text } => controller.on_capture_final(&text),
            ClientMessage::CaptureError { reason } => controller.on_capture_error(CaptureError::from_reason(&reason)),
            ClientMessage::OutputComplete => controller.on_output_complete(),
            ClientMessage::Continue => controller.resume(),
            ClientMessage::Retry => controller.retry(),
            ClientMessage::SubmitText { text } => controller.submit_text(&text),
            ClientMessage::SwitchMode { strategy } => controller.switch_strategy(strategy),
            ClientMessage::EndCall => controller.end(EndReason::UserEnded),
            ClientMessage::StartCall(_) | ClientMessage::Pong { .. } => {}
        }
    }

    /// Collect everything the controller produced since the last drain.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();

        while let Ok(message) = self.outbox.try_recv() {
            drained.messages.push(message);
        }

        while let Ok(event) = self.events.try_recv() {
            match event {
                TurnEvent::StateChanged(state) => drained.messages.push(ServerMessage::state(state)),
                TurnEvent::Partial(text) => drained.messages.push(ServerMessage::Transcript { text }),
                TurnEvent::RequestTurn(request) => {
                    if let TurnMessage::User(text) = &request.message {
                        drained.messages.push(ServerMessage::TurnSent { text: text.clone() });
                    }
                    drained.requests.push(request);
                }
                TurnEvent::Error(err) => drained.messages.push(ServerMessage::error(err.code(), err.to_string())),
                TurnEvent::Ended(reason) => {
                    drained.messages.push(ServerMessage::CallEnded {
                        reason: reason.as_str(),
                    });
                    drained.ended = Some(reason);
                }
            }
        }

        drained
    }
}

/// A resolved `start_call`.
#[derive(Debug)]
pub struct PreparedCall {
    pub target: TurnTarget,
    pub strategy: CaptureStrategy,
    pub call_limit: Option<Duration>,
    pub has_history: bool,
}

/// Open the call's session, then charge a trial window if the call is a
/// trial. A window is never charged for a call that cannot start.
pub fn prepare_call(state: &AppState, request: StartCall) -> Result<PreparedCall, ServerMessage> {
    let StartCall {
        session_id,
        user_id,
        kind,
        capabilities,
        trial_client_id,
        language,
    } = request;

    let user_id = user_id
        .or_else(|| trial_client_id.clone())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ServerMessage::error("bad_request", "Missing user_id"))?;
    let kind = match trial_client_id {
        Some(_) => SessionKind::TrialCall,
        None => kind.unwrap_or(SessionKind::Call),
    };

    let target = TurnTarget::new(user_id, session_id, kind).with_settings(SessionSettings {
        language,
        therapist_name: None,
    });
    let session = state
        .conversation
        .sessions()
        .open(&target.user_id, &target.session_id, target.kind, &target.settings)
        .map_err(|err| ServerMessage::error("session_error", err.to_string()))?;

    let call_limit = match &trial_client_id {
        Some(client_id) => match state.trial.start_call(client_id) {
            CallStart::Started(status) | CallStart::Resumed(status) => Some(Duration::from_secs(status.remaining)),
            CallStart::Denied => {
                return Err(ServerMessage::error("no_sessions_left", "No trial call sessions left"));
            }
        },
        None => None,
    };

    Ok(PreparedCall {
        target,
        strategy: CaptureStrategy::select(&capabilities),
        call_limit,
        has_history: session.has_history(),
    })
}

/// One `/ws/call` connection.
pub struct CallWebSocket {
    state: AppState,
    driver: Option<CallDriver>,
    target: Option<TurnTarget>,
    /// Bumped on every `start_call`; replies carry the value they were sent under
    generation: u64,
    timer: Option<SpawnHandle>,
    titling: bool,
    last_heartbeat: Instant,
}

impl CallWebSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            driver: None,
            target: None,
            generation: 0,
            timer: None,
            titling: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize server message"),
        }
    }

    fn send_error(ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code, message, "Call error");
        Self::send(ctx, &ServerMessage::error(code, message));
    }

    fn handle_start_call(&mut self, request: StartCall, ctx: &mut ws::WebsocketContext<Self>) {
        if self.driver.as_ref().is_some_and(|d| d.state() != TurnState::Idle) {
            Self::send_error(ctx, "call_in_progress", "A call is already running on this connection");
            return;
        }

        let call = match prepare_call(&self.state, request) {
            Ok(call) => call,
            Err(refusal) => {
                warn!(?refusal, "Call not started");
                Self::send(ctx, &refusal);
                return;
            }
        };

        info!(
            session_id = %call.target.session_id,
            kind = call.target.kind.as_str(),
            strategy = call.strategy.as_str(),
            "Call starting"
        );

        self.generation += 1;
        self.titling = false;
        let config = self.state.get_config();
        let mut driver = CallDriver::new(
            &call.target.session_id,
            self.generation,
            config.turn.turn_config(call.call_limit),
            call.strategy,
            Arc::new(SystemClock),
        );

        Self::send(
            ctx,
            &ServerMessage::CallStarted {
                session_id: call.target.session_id.clone(),
                strategy: call.strategy,
                remaining_secs: call.call_limit.map(|d| d.as_secs()),
            },
        );

        driver.start(call.has_history);
        self.driver = Some(driver);
        self.target = Some(call.target);
        self.pump(ctx);
    }

    /// Flush driver output to the socket, dispatch turn requests and re-arm
    /// the wake-up for the next deadline.
    fn pump(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let drained = driver.drain();

        for message in &drained.messages {
            Self::send(ctx, message);
        }
        for request in drained.requests {
            self.dispatch(request, ctx);
        }

        if let Some(reason) = drained.ended {
            debug!(reason = reason.as_str(), "Call finished");
            if let Some(handle) = self.timer.take() {
                ctx.cancel_future(handle);
            }
            self.driver = None;
            self.target = None;
            return;
        }

        self.reschedule(ctx);
    }

    fn reschedule(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(handle) = self.timer.take() {
            ctx.cancel_future(handle);
        }

        let Some(delay) = self.driver.as_ref().and_then(|d| d.wake_delay(Instant::now())) else {
            return;
        };

        self.timer = Some(ctx.run_later(delay, |act, ctx| {
            act.timer = None;
            if let Some(driver) = act.driver.as_mut() {
                driver.tick();
            }
            act.pump(ctx);
        }));
    }

    fn dispatch(&mut self, request: TurnRequest, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let conversation = self.state.conversation.clone();
        let generation = self.generation;
        let id = request.id;
        let message = request.message.as_wire().to_string();

        debug!(request_id = id.0, session_id = %target.session_id, "Dispatching turn");
        ctx.spawn(
            async move { conversation.exchange(&target, &message).await }
                .into_actor(self)
                .map(move |result, act, ctx| act.on_turn_result(generation, id, result, ctx)),
        );
    }

    fn on_turn_result(
        &mut self,
        generation: u64,
        id: RequestId,
        result: Result<TurnReply, ConversationError>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let outcome = match self.driver.as_mut() {
            Some(driver) => driver.apply_turn_result(generation, id, result),
            None => ReplyOutcome::Stale,
        };

        match outcome {
            ReplyOutcome::Stale => {
                debug!(request_id = id.0, "Dropping reply from an earlier call");
                return;
            }
            ReplyOutcome::Answered { needs_title } => {
                self.state.increment_turns_exchanged();
                if needs_title {
                    self.request_title(ctx);
                }
            }
            ReplyOutcome::Failed => {}
        }
        self.pump(ctx);
    }

    fn request_title(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.titling {
            return;
        }
        let Some(target) = self.target.clone() else {
            return;
        };
        self.titling = true;

        let conversation = self.state.conversation.clone();
        ctx.spawn(
            async move { conversation.generate_title(&target.user_id, &target.session_id).await }
                .into_actor(self)
                .map(|result, act, ctx| {
                    act.titling = false;
                    match result {
                        Ok(name) => Self::send(ctx, &ServerMessage::SessionRenamed { name }),
                        Err(err) => warn!(error = %err, "Could not title session"),
                    }
                }),
        );
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                Self::send_error(ctx, "invalid_json", &format!("Invalid message: {}", err));
                return;
            }
        };

        match message {
            ClientMessage::StartCall(request) => self.handle_start_call(request, ctx),
            ClientMessage::Pong { .. } => self.last_heartbeat = Instant::now(),
            other => match self.driver.as_mut() {
                Some(driver) => {
                    driver.apply(other);
                    self.pump(ctx);
                }
                None => Self::send_error(ctx, "no_active_call", "Send start_call first"),
            },
        }
    }
}

impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Call connection opened");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Call connection heartbeat timed out");
                ctx.stop();
                return;
            }
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            Self::send(ctx, &ServerMessage::Ping { timestamp });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(driver) = self.driver.as_mut() {
            driver.end(EndReason::Disconnected);
        }
        self.driver = None;
        self.state.close_call();
        info!("Call connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                Self::send_error(ctx, "unsupported", "Binary frames are not accepted");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "Client closed call connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// `GET /ws/call`. Refused with 403 once `max_concurrent_calls` are open.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    if !state.try_open_call() {
        warn!("Rejecting call connection, capacity reached");
        return Err(AppError::Forbidden("Too many concurrent calls".to_string()).into());
    }

    let result = ws::start(CallWebSocket::new(state.get_ref().clone()), &req, stream);
    if result.is_err() {
        state.close_call();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrialConfig;
    use crate::conversation::testing::ScriptedBackend;
    use crate::state::testing::state_with;
    use crate::trial::TrialLedger;
    use crate::turn::clock::ManualClock;

    const GENERATION: u64 = 2;

    fn driver(strategy: CaptureStrategy) -> (CallDriver, ManualClock) {
        let clock = ManualClock::new();
        let driver = CallDriver::new(
            "c1",
            GENERATION,
            TurnConfig::default(),
            strategy,
            Arc::new(clock.clone()),
        );
        (driver, clock)
    }

    fn start_call(json: &str) -> StartCall {
        match parse(json) {
            ClientMessage::StartCall(request) => request,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn error_code(message: ServerMessage) -> String {
        match message {
            ServerMessage::Error { code, .. } => code,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn parse(json: &str) -> ClientMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn start_call_parses_with_defaults() {
        let request = start_call(r#"{"type":"start_call","session_id":"c1","capabilities":{"speech_recognition":true}}"#);
        assert_eq!(request.session_id, "c1");
        assert_eq!(request.user_id, None);
        assert_eq!(request.kind, None);
        assert_eq!(CaptureStrategy::select(&request.capabilities), CaptureStrategy::Continuous);

        assert_eq!(parse(r#"{"type":"output_complete"}"#), ClientMessage::OutputComplete);
        assert_eq!(
            parse(r#"{"type":"switch_mode","strategy":"push_to_talk"}"#),
            ClientMessage::SwitchMode {
                strategy: CaptureStrategy::PushToTalk
            }
        );
    }

    #[test]
    fn state_message_carries_continue_reason() {
        let json = serde_json::to_value(ServerMessage::state(TurnState::AwaitingContinue(
            ContinueReason::LongSilence,
        )))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "state", "state": "awaiting_continue", "reason": "long_silence"})
        );

        let json = serde_json::to_value(ServerMessage::state(TurnState::UserListening)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "state", "state": "user_listening"}));
    }

    #[test]
    fn greeting_flow_produces_protocol_messages() {
        let (mut driver, _clock) = driver(CaptureStrategy::Continuous);
        driver.start(false);

        let drained = driver.drain();
        assert_eq!(drained.requests.len(), 1);
        assert_eq!(drained.requests[0].message, TurnMessage::Greeting);
        assert!(!drained
            .messages
            .iter()
            .any(|m| matches!(m, ServerMessage::TurnSent { .. })));

        driver.on_reply(drained.requests[0].id, Ok("Hello, I'm here.".to_string()));
        let drained = driver.drain();
        assert!(drained.messages.contains(&ServerMessage::Speak {
            text: "Hello, I'm here.".to_string()
        }));

        driver.apply(ClientMessage::OutputComplete);
        let drained = driver.drain();
        assert_eq!(drained.messages[0], ServerMessage::BeginCapture);
        assert!(drained.messages.contains(&ServerMessage::state(TurnState::UserListening)));
        assert!(driver.next_deadline().is_some());
    }

    #[test]
    fn silence_after_partial_sends_turn() {
        let (mut driver, clock) = driver(CaptureStrategy::Continuous);
        driver.start(true);
        driver.drain();

        driver.apply(ClientMessage::Partial {
            text: "hello there".to_string(),
        });
        let drained = driver.drain();
        assert!(drained.messages.contains(&ServerMessage::Transcript {
            text: "hello there".to_string()
        }));

        clock.advance(Duration::from_millis(4500));
        driver.tick();
        let drained = driver.drain();

        assert_eq!(drained.requests.len(), 1);
        assert!(drained.messages.contains(&ServerMessage::CancelCapture));
        assert!(drained.messages.contains(&ServerMessage::TurnSent {
            text: "hello there".to_string()
        }));
    }

    #[test]
    fn typed_calls_hand_back_the_floor_after_display() {
        let (mut driver, _clock) = driver(CaptureStrategy::Typed);
        driver.start(true);
        driver.drain();

        driver.apply(ClientMessage::SubmitText {
            text: "I'd rather type".to_string(),
        });
        let id = driver.drain().requests[0].id;
        driver.on_reply(id, Ok("That's fine.".to_string()));

        let drained = driver.drain();
        assert!(drained.messages.contains(&ServerMessage::Speak {
            text: "That's fine.".to_string()
        }));
        assert_eq!(driver.state(), TurnState::UserListening);
    }

    #[test]
    fn failure_and_end_are_reported() {
        let (mut driver, clock) = driver(CaptureStrategy::Continuous);
        driver.start(true);
        driver.apply(ClientMessage::Partial { text: "hi".to_string() });
        clock.advance(Duration::from_secs(5));
        driver.tick();
        let id = driver.drain().requests[0].id;

        driver.on_reply(id, Err(TurnError::NetworkFailure("timeout".to_string())));
        let drained = driver.drain();
        assert!(drained
            .messages
            .iter()
            .any(|m| matches!(m, ServerMessage::Error { code, .. } if code == "network_failure")));

        driver.apply(ClientMessage::EndCall);
        let drained = driver.drain();
        assert_eq!(drained.ended, Some(EndReason::UserEnded));
        assert!(drained.messages.contains(&ServerMessage::CallEnded { reason: "user_ended" }));
        assert_eq!(driver.next_deadline(), None);
    }

    #[test]
    fn denied_microphone_is_reported_as_input_unavailable() {
        let (mut driver, _clock) = driver(CaptureStrategy::Continuous);
        driver.start(true);
        driver.drain();

        driver.apply(ClientMessage::CaptureError {
            reason: "not-allowed".to_string(),
        });
        let drained = driver.drain();

        assert!(drained
            .messages
            .iter()
            .any(|m| matches!(m, ServerMessage::Error { code, .. } if code == "input_unavailable")));
        assert_eq!(
            driver.state(),
            TurnState::AwaitingContinue(ContinueReason::CaptureUnavailable)
        );
    }

    #[test]
    fn wake_delay_follows_the_nearest_deadline() {
        let (mut driver, clock) = driver(CaptureStrategy::Continuous);
        assert_eq!(driver.wake_delay(clock.now()), None);

        driver.start(true);
        assert_eq!(driver.wake_delay(clock.now()), Some(Duration::from_millis(4500)));

        clock.advance(Duration::from_secs(1));
        driver.apply(ClientMessage::Partial { text: "so".to_string() });
        clock.advance(Duration::from_secs(2));
        assert_eq!(driver.wake_delay(clock.now()), Some(Duration::from_millis(2500)));

        // An overdue deadline asks for an immediate wake-up.
        clock.advance(Duration::from_secs(10));
        assert_eq!(driver.wake_delay(clock.now()), Some(Duration::ZERO));

        driver.end(EndReason::UserEnded);
        assert_eq!(driver.wake_delay(clock.now()), None);
    }

    #[test]
    fn replies_from_another_call_are_ignored() {
        let (mut driver, clock) = driver(CaptureStrategy::Continuous);
        driver.start(true);
        driver.apply(ClientMessage::Partial { text: "hello".to_string() });
        clock.advance(Duration::from_secs(5));
        driver.tick();
        let id = driver.drain().requests[0].id;
        let reply = || {
            Ok(TurnReply {
                reply: "Hi.".to_string(),
                needs_title: true,
            })
        };

        assert_eq!(driver.apply_turn_result(GENERATION - 1, id, reply()), ReplyOutcome::Stale);
        assert_eq!(driver.state().as_str(), "awaiting_reply");
        assert!(driver.drain().messages.is_empty());

        assert_eq!(
            driver.apply_turn_result(GENERATION, id, reply()),
            ReplyOutcome::Answered { needs_title: true }
        );
        assert!(driver.drain().messages.contains(&ServerMessage::Speak { text: "Hi.".to_string() }));
    }

    #[test]
    fn busy_session_fails_the_turn_recoverably() {
        let (mut driver, _clock) = driver(CaptureStrategy::Typed);
        driver.start(true);
        driver.apply(ClientMessage::SubmitText { text: "hi".to_string() });
        let id = driver.drain().requests[0].id;

        let outcome = driver.apply_turn_result(
            GENERATION,
            id,
            Err(ConversationError::Busy {
                session_id: "c1".to_string(),
            }),
        );

        assert_eq!(outcome, ReplyOutcome::Failed);
        assert_eq!(
            driver.state(),
            TurnState::AwaitingContinue(ContinueReason::RequestFailed)
        );
    }

    #[test]
    fn trial_call_is_charged_once_the_session_opens() {
        let state = state_with(Arc::new(ScriptedBackend::default()));

        let refused = prepare_call(
            &state,
            start_call(r#"{"type":"start_call","session_id":" ","trial_client_id":"t1"}"#),
        )
        .unwrap_err();
        assert_eq!(error_code(refused), "session_error");
        assert_eq!(state.trial.call_status("t1").sessions_left, 5);

        let call = prepare_call(
            &state,
            start_call(r#"{"type":"start_call","session_id":"trial_call","trial_client_id":"t1"}"#),
        )
        .unwrap();
        assert_eq!(call.target.kind, SessionKind::TrialCall);
        assert_eq!(call.target.user_id, "t1");
        assert_eq!(call.call_limit, Some(Duration::from_secs(300)));
        assert_eq!(call.strategy, CaptureStrategy::Typed);
        assert!(!call.has_history);
        assert_eq!(state.trial.call_status("t1").sessions_left, 4);
    }

    #[test]
    fn start_call_refusals() {
        let mut state = state_with(Arc::new(ScriptedBackend::default()));
        state.trial = Arc::new(TrialLedger::new(TrialConfig {
            call_max_sessions: 0,
            ..TrialConfig::default()
        }));

        let missing_user = prepare_call(&state, start_call(r#"{"type":"start_call","session_id":"c1"}"#));
        assert_eq!(error_code(missing_user.unwrap_err()), "bad_request");

        let denied = prepare_call(
            &state,
            start_call(r#"{"type":"start_call","session_id":"c1","trial_client_id":"t1"}"#),
        );
        assert_eq!(error_code(denied.unwrap_err()), "no_sessions_left");

        let call = prepare_call(
            &state,
            start_call(r#"{"type":"start_call","session_id":"c2","user_id":"u1","kind":"call"}"#),
        )
        .unwrap();
        assert_eq!(call.target.kind, SessionKind::Call);
        assert_eq!(call.call_limit, None);
    }
}
