//! # Turn States
//!
//! Exactly one [`TurnState`] is active per call at any moment.
//!
//! ## Transitions:
//! - `Idle` → `AssistantSpeaking`: a reply is requested or ready
//! - `AssistantSpeaking` → `UserListening`: output completed
//! - `UserListening` → `AssistantSpeaking`: input finalized and sent
//! - `UserListening` → `AwaitingContinue`: long silence, capture failure
//! - `AwaitingContinue` → `UserListening`: explicit user gesture

use serde::Serialize;

/// Identifier attached to each outbound turn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakingPhase {
    /// A turn request is in flight; nothing else may be sent.
    AwaitingReply(RequestId),
    /// The reply is being spoken or displayed.
    Delivering,
}

/// Why the controller stopped listening and is waiting for a gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueReason {
    LongSilence,
    TapToSpeak,
    CaptureUnavailable,
    RequestFailed,
}

impl ContinueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinueReason::LongSilence => "long_silence",
            ContinueReason::TapToSpeak => "tap_to_speak",
            ContinueReason::CaptureUnavailable => "capture_unavailable",
            ContinueReason::RequestFailed => "request_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AssistantSpeaking(SpeakingPhase),
    UserListening,
    AwaitingContinue(ContinueReason),
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::AssistantSpeaking(SpeakingPhase::AwaitingReply(_)) => "awaiting_reply",
            TurnState::AssistantSpeaking(SpeakingPhase::Delivering) => "assistant_speaking",
            TurnState::UserListening => "user_listening",
            TurnState::AwaitingContinue(_) => "awaiting_continue",
        }
    }

    pub fn continue_reason(&self) -> Option<ContinueReason> {
        match self {
            TurnState::AwaitingContinue(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        match self {
            TurnState::AssistantSpeaking(SpeakingPhase::AwaitingReply(id)) => Some(*id),
            _ => None,
        }
    }
}

/// Best-effort transcript of the user turn in progress.
///
/// Recognizers report the cumulative transcript on every result, so an
/// update replaces the contents instead of appending.
#[derive(Debug, Default, Clone)]
pub struct UtteranceBuffer {
    text: String,
}

impl UtteranceBuffer {
    pub fn replace(&mut self, partial: &str) {
        self.text.clear();
        self.text.push_str(partial.trim());
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Empty the buffer and hand back what it held.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn reset(&mut self) {
        self.text.clear();
    }
}
