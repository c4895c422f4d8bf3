//! Prompt construction for turns and session titles.

use crate::inference::PromptMessage;
use crate::session::{Message, Role, Session, SessionKind};

/// Transcript lines fed to call titling.
pub const CALL_TITLE_WINDOW: usize = 6;

pub const CHAT_TITLE_FALLBACK: &str = "Session";
pub const CALL_TITLE_FALLBACK: &str = "Unnamed Session";

fn language_rule(language: &str) -> String {
    format!(
        "Always respond ONLY in {language}. \
         Do not translate or add English unless the selected language is English. "
    )
}

/// System prompt for a session.
pub fn system_prompt(session: &Session) -> String {
    match session.kind {
        SessionKind::Call | SessionKind::TrialCall => {
            "You are a compassionate, emotionally intelligent therapist. \
             Always reply in fluent English. Keep responses short and empathetic."
                .to_string()
        }
        SessionKind::Chat => format!(
            "You are {}, a supportive and emotionally intelligent companion. {}\
             Adapt your tone and style to match the user's emotions.",
            session.therapist_name,
            language_rule(&session.language)
        ),
        SessionKind::TrialChat => format!(
            "You are a supportive, emotionally intelligent companion. {}\
             Adapt your tone and style to the user's emotions.",
            language_rule(&session.language)
        ),
    }
}

/// Full prompt for the next reply: system prompt, then the transcript.
/// Trial chat is single-turn and only sees the latest user message.
pub fn turn_prompt(session: &Session) -> Vec<PromptMessage> {
    let mut prompt = vec![PromptMessage::system(system_prompt(session))];

    let history: &[Message] = if session.kind == SessionKind::TrialChat {
        let start = session
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(session.messages.len());
        &session.messages[start..]
    } else {
        &session.messages
    };

    prompt.extend(history.iter().map(|m| match m.role {
        Role::User => PromptMessage::user(m.content.clone()),
        Role::Assistant => PromptMessage::assistant(m.content.clone()),
    }));
    prompt
}

/// Title prompt for a text chat, built from its opening message.
pub fn chat_title_prompt(first_message: &str, language: &str) -> Vec<PromptMessage> {
    vec![
        PromptMessage::system(format!(
            "You are a helpful assistant. Generate a short, natural 2-4 word session title in {language}. \
             If {language} is not supported, return it in English. \
             Do NOT include quotes, punctuation, or explanations - just the title."
        )),
        PromptMessage::user(first_message),
    ]
}

/// Title prompt for a call, built from the latest transcript lines.
pub fn call_title_prompt(messages: &[Message]) -> Vec<PromptMessage> {
    let mut prompt = String::from(
        "You are an assistant that generates short, meaningful titles for therapy sessions. \
         Summarize the emotional focus or main theme of this therapy session in 2-4 words. \
         Use title case. Do not add quotes, explanations, or extra text.\n\n",
    );

    let start = messages.len().saturating_sub(CALL_TITLE_WINDOW);
    for message in &messages[start..] {
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Therapist",
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }

    vec![PromptMessage::user(prompt)]
}

/// Reduce a model answer to a usable title: first line, no wrapping quotes
/// or trailing punctuation.
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let title = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '“' | '”'))
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | ':'))
        .trim();

    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(kind: SessionKind) -> Session {
        let mut session = Session::new("u1", "s1", kind);
        session.language = "es".to_string();
        session.therapist_name = "Luz".to_string();
        session
    }

    #[test]
    fn chat_prompt_names_therapist_and_language() {
        let prompt = system_prompt(&session(SessionKind::Chat));
        assert!(prompt.starts_with("You are Luz,"));
        assert!(prompt.contains("ONLY in es"));
    }

    #[test]
    fn call_prompt_is_always_english() {
        let prompt = system_prompt(&session(SessionKind::Call));
        assert!(prompt.contains("fluent English"));
        assert!(!prompt.contains(" es."));
    }

    #[test]
    fn turn_prompt_carries_full_history() {
        let mut s = session(SessionKind::Chat);
        s.messages = vec![Message::user("hola"), Message::assistant("hola!"), Message::user("bien")];
        let prompt = turn_prompt(&s);

        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[0].role, "system");
        assert_eq!(prompt[2], PromptMessage::assistant("hola!"));
        assert_eq!(prompt[3], PromptMessage::user("bien"));
    }

    #[test]
    fn trial_chat_is_single_turn() {
        let mut s = session(SessionKind::TrialChat);
        s.messages = vec![Message::user("one"), Message::assistant("reply"), Message::user("two")];
        let prompt = turn_prompt(&s);

        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[1], PromptMessage::user("two"));
    }

    #[test]
    fn call_title_uses_last_six_lines() {
        let messages: Vec<Message> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("line {i}"))
                } else {
                    Message::assistant(format!("line {i}"))
                }
            })
            .collect();
        let prompt = call_title_prompt(&messages);
        let text = &prompt[0].content;

        assert!(!text.contains("line 1\n"));
        assert!(text.contains("User: line 2\n"));
        assert!(text.contains("Therapist: line 7\n"));
    }

    #[test]
    fn titles_are_cleaned_to_first_line() {
        assert_eq!(clean_title("\"Work Stress\"\nBecause...").as_deref(), Some("Work Stress"));
        assert_eq!(clean_title("\n  Family Tension.  ").as_deref(), Some("Family Tension"));
        assert_eq!(clean_title("  \n \"\" "), None);
    }
}
