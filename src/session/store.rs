//! # Session Store
//!
//! In-memory, per-user session storage. Transcripts only ever grow: the
//! store appends messages, renames and deletes whole sessions, and accepts a
//! client snapshot only when it extends what is already stored.
//!
//! Locks are held for the duration of one method call and never across an
//! `.await`.

use crate::session::model::{DisplayName, Message, Session, SessionKind};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {session_id} not found")]
    NotFound { session_id: String },

    #[error("snapshot for session {session_id} does not extend the stored transcript ({stored} stored messages)")]
    NotAPrefix { session_id: String, stored: usize },

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("session store lock poisoned")]
    Poisoned,
}

/// Fields a client may send when saving a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub kind: Option<SessionKind>,
    pub name: Option<DisplayName>,
    pub messages: Option<Vec<Message>>,
}

/// Per-session preferences supplied with a turn.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub language: Option<String>,
    pub therapist_name: Option<String>,
}

type SessionKey = (String, String);

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(user_id: &str, session_id: &str) -> SessionKey {
        (user_id.to_string(), session_id.to_string())
    }

    /// Fetch a session, creating an empty one of `kind` on first use.
    /// Settings that are provided overwrite the stored ones.
    pub fn open(
        &self,
        user_id: &str,
        session_id: &str,
        kind: SessionKind,
        settings: &SessionSettings,
    ) -> Result<Session, SessionError> {
        if session_id.trim().is_empty() {
            return Err(SessionError::MissingField("session_id"));
        }

        let mut sessions = self.sessions.write().map_err(|_| SessionError::Poisoned)?;
        let session = sessions
            .entry(Self::key(user_id, session_id))
            .or_insert_with(|| {
                info!(user_id, session_id, kind = kind.as_str(), "Creating session");
                Session::new(user_id, session_id, kind)
            });

        if let Some(language) = settings.language.as_deref().filter(|l| !l.is_empty()) {
            session.language = language.to_string();
        }
        if let Some(name) = settings.therapist_name.as_deref().filter(|n| !n.is_empty()) {
            session.therapist_name = name.to_string();
        }

        Ok(session.clone())
    }

    pub fn get(&self, user_id: &str, session_id: &str) -> Result<Session, SessionError> {
        let sessions = self.sessions.read().map_err(|_| SessionError::Poisoned)?;
        sessions
            .get(&Self::key(user_id, session_id))
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })
    }

    /// All sessions of a user, oldest first.
    pub fn list(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        let sessions = self.sessions.read().map_err(|_| SessionError::Poisoned)?;
        let mut owned: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(owned)
    }

    /// Append one message; returns the new transcript length.
    pub fn append(&self, user_id: &str, session_id: &str, message: Message) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write().map_err(|_| SessionError::Poisoned)?;
        let session = sessions
            .get_mut(&Self::key(user_id, session_id))
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;

        debug!(session_id, role = message.role.as_str(), "Appending message");
        session.messages.push(message);
        Ok(session.messages.len())
    }

    pub fn rename(
        &self,
        user_id: &str,
        session_id: &str,
        name: DisplayName,
        generated: bool,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().map_err(|_| SessionError::Poisoned)?;
        let session = sessions
            .get_mut(&Self::key(user_id, session_id))
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;

        session.name = name;
        session.title_generated |= generated;
        Ok(())
    }

    /// Mirror a client snapshot. Only provided fields are written, and a
    /// transcript is accepted only if the stored one is a prefix of it.
    pub fn save(&self, user_id: &str, snapshot: SessionSnapshot) -> Result<Session, SessionError> {
        if snapshot.session_id.trim().is_empty() {
            return Err(SessionError::MissingField("session_id"));
        }

        let mut sessions = self.sessions.write().map_err(|_| SessionError::Poisoned)?;
        let key = Self::key(user_id, &snapshot.session_id);
        let kind = snapshot.kind.unwrap_or_default();

        if let Some(existing) = sessions.get(&key) {
            if let Some(messages) = snapshot.messages.as_deref().filter(|m| !m.is_empty()) {
                if !existing.is_prefix_of(messages) {
                    return Err(SessionError::NotAPrefix {
                        session_id: snapshot.session_id,
                        stored: existing.messages.len(),
                    });
                }
            }
        }

        let session = sessions
            .entry(key)
            .or_insert_with(|| Session::new(user_id, snapshot.session_id.clone(), kind));

        if let Some(name) = snapshot.name {
            session.name = name;
        }
        if let Some(messages) = snapshot.messages.filter(|m| !m.is_empty()) {
            session.messages = messages;
        }

        debug!(
            session_id = %session.id,
            messages = session.messages.len(),
            "Session saved"
        );
        Ok(session.clone())
    }

    /// Remove a whole session. Returns whether it existed.
    pub fn delete(&self, user_id: &str, session_id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.write().map_err(|_| SessionError::Poisoned)?;
        let removed = sessions.remove(&Self::key(user_id, session_id)).is_some();
        if removed {
            info!(user_id, session_id, "Session deleted");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}
