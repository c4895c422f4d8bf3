//! # Conversation Service
//!
//! The backend turn exchange: `(session_id, message) → reply | error`, one
//! request/response unit per call. It owns the [`SessionStore`] and records
//! both sides of every successful turn.
//!
//! ## Failure behaviour:
//! When inference fails the user's message stays recorded and the session
//! stays usable. Resending the same unanswered message (a retry) does not
//! record it twice.
//!
//! ## One turn per session:
//! A session has at most one exchange in flight across every caller (HTTP
//! turns and call connections alike). A second exchange on a busy session
//! fails with [`ConversationError::Busy`] and records nothing.
//!
//! ## Titles:
//! After the first real exchange a session gets a short generated title.
//! Failed titling falls back to a fixed label and leaves the session free
//! to be titled later.

use crate::inference::prompt::{self, CALL_TITLE_FALLBACK, CHAT_TITLE_FALLBACK};
use crate::inference::{CompletionBackend, InferenceError, Sampling};
use crate::session::{DisplayName, Message, Role, SessionError, SessionKind, SessionSettings, SessionStore};
use crate::turn::controller::GREETING_SENTINEL;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ConversationError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("message is empty")]
    EmptyMessage,

    #[error("a turn is already in flight for session {session_id}")]
    Busy { session_id: String },
}

type SessionKey = (String, String);

/// Marks a session busy until dropped, including when the exchange future
/// is cancelled mid-flight.
struct InFlight<'a> {
    busy: &'a Mutex<HashSet<SessionKey>>,
    key: SessionKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.busy.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.key);
    }
}

/// Where a turn goes: the owning user, the session and how to create it.
#[derive(Debug, Clone)]
pub struct TurnTarget {
    pub user_id: String,
    pub session_id: String,
    pub kind: SessionKind,
    pub settings: SessionSettings,
}

impl TurnTarget {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            kind,
            settings: SessionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub reply: String,
    /// The session has real turns but no generated title yet
    pub needs_title: bool,
}

pub struct ConversationService {
    sessions: Arc<SessionStore>,
    backend: Arc<dyn CompletionBackend>,
    in_flight: Mutex<HashSet<SessionKey>>,
}

impl ConversationService {
    pub fn new(sessions: Arc<SessionStore>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            sessions,
            backend,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, target: &TurnTarget) -> Result<InFlight<'_>, ConversationError> {
        let key = (target.user_id.clone(), target.session_id.clone());
        let mut busy = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(key.clone()) {
            debug!(session_id = %target.session_id, "Rejecting overlapping turn");
            return Err(ConversationError::Busy {
                session_id: target.session_id.clone(),
            });
        }
        Ok(InFlight {
            busy: &self.in_flight,
            key,
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Exchange one turn. `__init__` records nothing and asks the model to
    /// open the conversation.
    pub async fn exchange(&self, target: &TurnTarget, message: &str) -> Result<TurnReply, ConversationError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ConversationError::EmptyMessage);
        }
        let _in_flight = self.claim(target)?;

        let session = self
            .sessions
            .open(&target.user_id, &target.session_id, target.kind, &target.settings)?;

        if message != GREETING_SENTINEL {
            if session.unanswered_user_message() == Some(message) {
                debug!(session_id = %target.session_id, "Retrying unanswered message");
            } else {
                self.sessions
                    .append(&target.user_id, &target.session_id, Message::user(message))?;
            }
        }

        let session = self.sessions.get(&target.user_id, &target.session_id)?;
        let sampling = if session.kind.is_call() {
            Sampling::CALL
        } else {
            Sampling::CHAT
        };

        let reply = match self.backend.complete(prompt::turn_prompt(&session), sampling).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session_id = %target.session_id, error = %e, "Turn exchange failed");
                return Err(e.into());
            }
        };

        self.sessions
            .append(&target.user_id, &target.session_id, Message::assistant(reply.clone()))?;

        info!(
            session_id = %target.session_id,
            kind = session.kind.as_str(),
            reply_chars = reply.len(),
            "Turn exchanged"
        );

        Ok(TurnReply {
            reply,
            needs_title: !session.title_generated && session.user_turns() > 0,
        })
    }

    /// Generate and store a title for a session from its transcript.
    /// Returns the fallback label, without storing it, when the model fails.
    pub async fn generate_title(&self, user_id: &str, session_id: &str) -> Result<String, ConversationError> {
        let session = self.sessions.get(user_id, session_id)?;

        let title = if session.kind.is_call() {
            self.suggest_call_title(&session.messages).await
        } else {
            let first = session
                .messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            self.suggest_chat_title(first, &session.language).await
        };

        match title {
            Some(title) => {
                self.sessions
                    .rename(user_id, session_id, DisplayName::Plain(title.clone()), true)?;
                info!(session_id, title = %title, "Session titled");
                Ok(title)
            }
            None if session.kind.is_call() => Ok(CALL_TITLE_FALLBACK.to_string()),
            None => Ok(CHAT_TITLE_FALLBACK.to_string()),
        }
    }

    /// 2-4 word title in `language` for a chat that opened with `message`.
    pub async fn suggest_chat_title(&self, message: &str, language: &str) -> Option<String> {
        if message.trim().is_empty() {
            return None;
        }
        self.title_from(prompt::chat_title_prompt(message, language)).await
    }

    /// Title-case title for a call from its latest transcript lines.
    pub async fn suggest_call_title(&self, messages: &[Message]) -> Option<String> {
        if messages.is_empty() {
            return None;
        }
        self.title_from(prompt::call_title_prompt(messages)).await
    }

    async fn title_from(&self, messages: Vec<crate::inference::PromptMessage>) -> Option<String> {
        match self.backend.complete(messages, Sampling::TITLE).await {
            Ok(raw) => prompt::clean_title(&raw),
            Err(e) => {
                warn!(error = %e, "Title generation failed");
                None
            }
        }
    }
}
