//! Error taxonomy for the turn controller.
//!
//! None of these end a session. `InputUnavailable` and `NetworkFailure` are
//! surfaced to the user; `EmptyCapture` is dropped quietly.

use thiserror::Error;

/// Why the input-capture mechanism could not start or keep running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("speech capture is not supported on this device")]
    Unsupported,

    #[error("microphone access was denied")]
    PermissionDenied,

    #[error("capture device error: {0}")]
    Device(String),
}

impl CaptureError {
    /// Parse the reason string a client reports for a capture failure.
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "unsupported" | "not-supported" => CaptureError::Unsupported,
            "permission_denied" | "not-allowed" | "service-not-allowed" => {
                CaptureError::PermissionDenied
            }
            other => CaptureError::Device(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("output delivery failed: {0}")]
pub struct OutputError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("input unavailable: {0}")]
    InputUnavailable(#[from] CaptureError),

    #[error("turn exchange failed: {0}")]
    NetworkFailure(String),

    #[error("finalized turn contained no usable text")]
    EmptyCapture,
}

impl TurnError {
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::InputUnavailable(_) => "input_unavailable",
            TurnError::NetworkFailure(_) => "network_failure",
            TurnError::EmptyCapture => "empty_capture",
        }
    }
}
