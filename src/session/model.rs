//! # Session Data Model
//!
//! A [`Session`] is an ordered transcript of [`Message`]s plus the metadata
//! the front-end shows in its session list. Messages are immutable once
//! appended and are never reordered or removed individually.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label used when a session has no usable name.
pub const DEFAULT_SESSION_NAME: &str = "New Session";
pub const DEFAULT_THERAPIST_NAME: &str = "Your Companion";
pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Chat,
    Call,
    TrialChat,
    TrialCall,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Chat => "chat",
            SessionKind::Call => "call",
            SessionKind::TrialChat => "trial_chat",
            SessionKind::TrialCall => "trial_call",
        }
    }

    /// Voice sessions get the short spoken-style prompt and call titling.
    pub fn is_call(&self) -> bool {
        matches!(self, SessionKind::Call | SessionKind::TrialCall)
    }
}

/// Who produced a message. Older clients spell the assistant `therapist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "therapist", alias = "bot")]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of a transcript. Clients may send `{sender, text}` or
/// `{role, content}`; both deserialize to the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(alias = "sender")]
    pub role: Role,
    #[serde(alias = "text")]
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A session name, either one string or one per language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DisplayName {
    Plain(String),
    Localized(BTreeMap<String, String>),
}

impl DisplayName {
    /// Resolve the name for `language`, falling back to English, then to any
    /// translation, then to [`DEFAULT_SESSION_NAME`].
    pub fn resolve(&self, language: &str) -> &str {
        match self {
            DisplayName::Plain(name) if !name.trim().is_empty() => name,
            DisplayName::Plain(_) => DEFAULT_SESSION_NAME,
            DisplayName::Localized(names) => names
                .get(language)
                .or_else(|| names.get(DEFAULT_LANGUAGE))
                .or_else(|| names.values().next())
                .map(String::as_str)
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(DEFAULT_SESSION_NAME),
        }
    }
}

impl Default for DisplayName {
    fn default() -> Self {
        DisplayName::Plain(DEFAULT_SESSION_NAME.to_string())
    }
}

impl From<&str> for DisplayName {
    fn from(name: &str) -> Self {
        DisplayName::Plain(name.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    #[serde(rename = "session_id")]
    pub id: String,
    #[serde(skip)]
    pub user_id: String,
    pub name: DisplayName,
    pub kind: SessionKind,
    pub language: String,
    pub therapist_name: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub title_generated: bool,
}

impl Session {
    pub fn new(user_id: impl Into<String>, id: impl Into<String>, kind: SessionKind) -> Self {
        let name = match kind {
            SessionKind::TrialChat => DisplayName::from("Trial Chat Session"),
            SessionKind::TrialCall => DisplayName::from("Trial Call Session"),
            _ => DisplayName::default(),
        };

        Self {
            id: id.into(),
            user_id: user_id.into(),
            name,
            kind,
            language: DEFAULT_LANGUAGE.to_string(),
            therapist_name: DEFAULT_THERAPIST_NAME.to_string(),
            messages: Vec::new(),
            created_at: Utc::now(),
            title_generated: false,
        }
    }

    pub fn has_history(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn display_name(&self) -> &str {
        self.name.resolve(&self.language)
    }

    /// Number of user turns recorded so far.
    pub fn user_turns(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    /// The trailing user message that never got a reply, if any.
    pub fn unanswered_user_message(&self) -> Option<&str> {
        match self.messages.last() {
            Some(Message {
                role: Role::User,
                content,
            }) => Some(content),
            _ => None,
        }
    }

    /// Whether `snapshot` extends the stored transcript without rewriting it.
    pub fn is_prefix_of(&self, snapshot: &[Message]) -> bool {
        snapshot.len() >= self.messages.len() && snapshot[..self.messages.len()] == self.messages[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_sender_text_shape_is_accepted() {
        let messages: Vec<Message> = serde_json::from_str(
            r#"[{"sender":"user","text":"hi"},{"sender":"therapist","text":"hello"},{"role":"assistant","content":"again"}]"#,
        )
        .unwrap();

        assert_eq!(messages[0], Message::user("hi"));
        assert_eq!(messages[1], Message::assistant("hello"));
        assert_eq!(messages[2].role, Role::Assistant);
    }

    #[test]
    fn localized_name_falls_back_to_english_then_any() {
        let name: DisplayName =
            serde_json::from_str(r#"{"en":"Work Stress","fr":"Stress au travail"}"#).unwrap();
        assert_eq!(name.resolve("fr"), "Stress au travail");
        assert_eq!(name.resolve("de"), "Work Stress");

        let only_es: DisplayName = serde_json::from_str(r#"{"es":"Ansiedad"}"#).unwrap();
        assert_eq!(only_es.resolve("de"), "Ansiedad");

        assert_eq!(DisplayName::Localized(BTreeMap::new()).resolve("en"), DEFAULT_SESSION_NAME);
        assert_eq!(DisplayName::from("  ").resolve("en"), DEFAULT_SESSION_NAME);
    }

    #[test]
    fn prefix_check_rejects_rewrites() {
        let mut session = Session::new("u1", "s1", SessionKind::Chat);
        session.messages = vec![Message::user("a"), Message::assistant("b")];

        assert!(session.is_prefix_of(&[Message::user("a"), Message::assistant("b"), Message::user("c")]));
        assert!(session.is_prefix_of(&[Message::user("a"), Message::assistant("b")]));
        assert!(!session.is_prefix_of(&[Message::user("a")]));
        assert!(!session.is_prefix_of(&[Message::user("x"), Message::assistant("b")]));
    }

    #[test]
    fn unanswered_message_is_trailing_user_turn() {
        let mut session = Session::new("u1", "s1", SessionKind::Call);
        assert_eq!(session.unanswered_user_message(), None);
        session.messages.push(Message::user("are you there"));
        assert_eq!(session.unanswered_user_message(), Some("are you there"));
        session.messages.push(Message::assistant("yes"));
        assert_eq!(session.unanswered_user_message(), None);
    }
}
