//! # Turn Exchange Endpoints
//!
//! - `POST /chat`: one text-chat turn
//! - `POST /call`: one voice-call turn (for clients not using `/ws/call`)
//! - `POST /chat/rename_session`, `POST /call/rename_session`: title suggestions
//!
//! A failed chat turn answers with an apology instead of an error so the
//! chat window keeps working; the user's message stays recorded either way.

use crate::conversation::TurnTarget;
use crate::error::{AppError, AppResult};
use crate::inference::prompt::{CALL_TITLE_FALLBACK, CHAT_TITLE_FALLBACK};
use crate::session::{DisplayName, Message, SessionKind, SessionSettings};
use crate::state::AppState;
use crate::turn::controller::GREETING_SENTINEL;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

pub const CHAT_FAILURE_REPLY: &str = "Sorry, something went wrong.";

#[derive(Debug, Deserialize)]
pub struct ChatTurnRequest {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub message: Option<String>,
    pub therapist: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallTurnRequest {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRenameRequest {
    #[serde(default)]
    pub message: String,
    pub language: Option<String>,
    /// When both ids are given the title is also stored on the session
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallRenameRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// Trimmed, non-empty field or a 400.
pub(crate) fn required(field: Option<String>) -> AppResult<String> {
    field
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing required fields".to_string()))
}

pub async fn chat(state: web::Data<AppState>, body: web::Json<ChatTurnRequest>) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let target = TurnTarget::new(required(body.user_id)?, required(body.session_id)?, SessionKind::Chat)
        .with_settings(SessionSettings {
            language: body.language,
            therapist_name: body.therapist,
        });
    let message = required(body.message)?;

    if message == GREETING_SENTINEL {
        let session = state.conversation.sessions().open(
            &target.user_id,
            &target.session_id,
            target.kind,
            &target.settings,
        )?;
        return Ok(HttpResponse::Ok().json(json!({
            "reply": "",
            "sessionName": session.display_name()
        })));
    }

    let reply = match state.conversation.exchange(&target, &message).await {
        Ok(turn) => {
            state.increment_turns_exchanged();
            turn.reply
        }
        Err(crate::conversation::ConversationError::Inference(e)) => {
            warn!(session_id = %target.session_id, error = %e, "Chat turn failed");
            CHAT_FAILURE_REPLY.to_string()
        }
        Err(e) => return Err(e.into()),
    };

    Ok(HttpResponse::Ok().json(json!({ "reply": reply })))
}

pub async fn call(state: web::Data<AppState>, body: web::Json<CallTurnRequest>) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let target = TurnTarget::new(required(body.user_id)?, required(body.session_id)?, SessionKind::Call);
    let message = required(body.message)?;

    let turn = state.conversation.exchange(&target, &message).await?;
    state.increment_turns_exchanged();

    Ok(HttpResponse::Ok().json(json!({
        "reply": turn.reply,
        "session_id": target.session_id
    })))
}

pub async fn rename_chat_session(
    state: web::Data<AppState>,
    body: web::Json<ChatRenameRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let language = body.language.as_deref().unwrap_or("en");

    let name = match state.conversation.suggest_chat_title(&body.message, language).await {
        Some(title) => {
            store_title(&state, body.user_id, body.session_id, &title)?;
            title
        }
        None => CHAT_TITLE_FALLBACK.to_string(),
    };

    Ok(HttpResponse::Ok().json(json!({ "name": name })))
}

pub async fn rename_call_session(
    state: web::Data<AppState>,
    body: web::Json<CallRenameRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();

    let name = match state.conversation.suggest_call_title(&body.messages).await {
        Some(title) => {
            store_title(&state, body.user_id, body.session_id, &title)?;
            title
        }
        None => CALL_TITLE_FALLBACK.to_string(),
    };

    Ok(HttpResponse::Ok().json(json!({ "name": name })))
}

/// Store a suggested title when the request names an existing session.
fn store_title(state: &AppState, user_id: Option<String>, session_id: Option<String>, title: &str) -> AppResult<()> {
    if let (Some(user_id), Some(session_id)) = (user_id, session_id) {
        let sessions = state.conversation.sessions();
        if sessions.get(&user_id, &session_id).is_ok() {
            sessions.rename(&user_id, &session_id, DisplayName::from(title), true)?;
        }
    }
    Ok(())
}
