//! # Input Capture
//!
//! The controller drives an [`InputCapture`] collaborator through
//! `begin()`/`cancel()`. Partial results and the capture's own finalization
//! come back as controller events, not through this trait.
//!
//! ## Strategy selection:
//! The capture strategy is chosen once, when a call starts, from the
//! capabilities the client declares. It is not re-checked afterwards.

use crate::turn::error::CaptureError;
use serde::{Deserialize, Serialize};

/// How user input is captured for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// Streaming recognition with partial results
    Continuous,
    /// Recording that starts only after a user gesture
    PushToTalk,
    /// Typed text, no microphone involved
    Typed,
}

impl CaptureStrategy {
    /// Pick the strategy for a client.
    pub fn select(capabilities: &ClientCapabilities) -> Self {
        if capabilities.speech_recognition && !capabilities.touch_only {
            CaptureStrategy::Continuous
        } else if capabilities.media_recorder {
            CaptureStrategy::PushToTalk
        } else {
            CaptureStrategy::Typed
        }
    }

    /// Whether silence timers govern finalization.
    pub fn uses_silence_timers(&self) -> bool {
        !matches!(self, CaptureStrategy::Typed)
    }

    /// Whether capture may begin without a user gesture.
    pub fn begins_automatically(&self) -> bool {
        !matches!(self, CaptureStrategy::PushToTalk)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStrategy::Continuous => "continuous",
            CaptureStrategy::PushToTalk => "push_to_talk",
            CaptureStrategy::Typed => "typed",
        }
    }
}

/// Capabilities a client reports when it starts a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCapabilities {
    /// Streaming speech recognition is available
    pub speech_recognition: bool,
    /// Raw audio recording is available
    pub media_recorder: bool,
    /// Platform needs a gesture before audio can start (mobile Safari)
    pub touch_only: bool,
}

/// The input-capture service the controller commands.
pub trait InputCapture: Send {
    /// Start capturing. An error means the mechanism is missing or denied.
    fn begin(&mut self) -> Result<(), CaptureError>;

    /// Stop capturing and drop anything not yet reported.
    fn cancel(&mut self);
}
