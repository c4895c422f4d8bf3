//! # Inference
//!
//! Chat-completion access for the conversation service.
//!
//! ## Key Components:
//! - **client**: [`CompletionClient`], an OpenAI-compatible HTTP client (Groq by default)
//! - **prompt**: system prompts and title prompts for each session kind
//!
//! The service talks to inference only through [`CompletionBackend`], so
//! tests substitute a scripted backend for the HTTP client.

pub mod client;
pub mod prompt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use client::CompletionClient;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("request to inference provider failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference provider returned no content")]
    EmptyResponse,

    #[error("no API key configured for the inference provider")]
    MissingApiKey,
}

/// One message of a completion prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Sampling parameters for one completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Sampling {
    pub const CHAT: Sampling = Sampling {
        temperature: 0.8,
        max_tokens: 400,
    };
    pub const CALL: Sampling = Sampling {
        temperature: 0.8,
        max_tokens: 500,
    };
    pub const TITLE: Sampling = Sampling {
        temperature: 0.6,
        max_tokens: 20,
    };
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Return the trimmed text of the first choice.
    async fn complete(&self, messages: Vec<PromptMessage>, sampling: Sampling) -> Result<String, InferenceError>;
}
