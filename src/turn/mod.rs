//! # Turn-Taking
//!
//! Decides, at any moment, whether the assistant is emitting speech/text or
//! the user is being listened to, and when to switch between the two.
//!
//! ## Key Components:
//! - **controller**: the state machine and its finalization policy
//! - **timer**: named, cancelable deadlines
//! - **clock**: injectable time source (system or manual)
//! - **capture / output**: collaborator traits the controller commands
//! - **state**: turn states and the utterance buffer
//! - **error**: `InputUnavailable`, `NetworkFailure`, `EmptyCapture`
//!
//! True voice-activity detection is not available on the client, so fixed
//! silence timeouts approximate the end of a user's turn.

pub mod capture;
pub mod clock;
pub mod controller;
pub mod error;
pub mod output;
pub mod state;
pub mod timer;

use std::time::Duration;

pub use capture::{CaptureStrategy, ClientCapabilities, InputCapture};
pub use clock::{Clock, SystemClock};
pub use controller::{EndReason, TurnController, TurnEvent, TurnMessage, TurnRequest};
pub use error::{CaptureError, OutputError, TurnError};
pub use output::OutputDelivery;
pub use state::{ContinueReason, RequestId, TurnState};

/// Thresholds that drive the controller's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnConfig {
    /// Silence after the last partial before a non-empty buffer is sent
    pub short_silence: Duration,
    /// Silence with an empty buffer before listening is abandoned
    pub long_silence: Duration,
    /// Optional cap on the whole call
    pub call_limit: Option<Duration>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            short_silence: Duration::from_millis(4500),
            long_silence: Duration::from_millis(10_000),
            call_limit: None,
        }
    }
}
