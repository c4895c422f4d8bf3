//! # Trial Endpoints
//!
//! Trial chat messages and trial call windows, keyed by the client id the
//! browser stores. Refusals use the body shapes the trial pages expect
//! (`{"redirect": ...}` for chat, `{"ok": false, ...}` with 403 for calls).

use crate::conversation::{ConversationError, TurnTarget};
use crate::error::AppResult;
use crate::handlers::turns::{required, CHAT_FAILURE_REPLY};
use crate::session::{SessionKind, SessionSettings};
use crate::state::AppState;
use crate::trial::{CallStart, ChatQuota};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

pub const SIGNUP_PATH: &str = "/signup";
pub const TRIAL_CHAT_SESSION: &str = "trial_chat";
pub const TRIAL_CALL_SESSION: &str = "trial_call";

#[derive(Debug, Deserialize)]
pub struct TrialChatRequest {
    pub client_id: Option<String>,
    pub message: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TrialClient {
    pub client_id: Option<String>,
}

pub async fn trial_chat_message(
    state: web::Data<AppState>,
    body: web::Json<TrialChatRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let client_id = required(body.client_id)?;

    if let ChatQuota::Exhausted = state.trial.record_chat_message(&client_id) {
        return Ok(HttpResponse::Ok().json(json!({ "redirect": SIGNUP_PATH })));
    }

    let message = required(body.message)?;
    let target = TurnTarget::new(client_id, TRIAL_CHAT_SESSION, SessionKind::TrialChat).with_settings(
        SessionSettings {
            language: body.language,
            therapist_name: None,
        },
    );

    let reply = match state.conversation.exchange(&target, &message).await {
        Ok(turn) => {
            state.increment_turns_exchanged();
            turn.reply
        }
        Err(ConversationError::Inference(e)) => {
            warn!(client_id = %target.user_id, error = %e, "Trial chat turn failed");
            CHAT_FAILURE_REPLY.to_string()
        }
        Err(e) => return Err(e.into()),
    };

    Ok(HttpResponse::Ok().json(json!({ "reply": reply })))
}

pub async fn trial_call_status(state: web::Data<AppState>, query: web::Query<TrialClient>) -> AppResult<HttpResponse> {
    let client_id = required(query.into_inner().client_id)?;
    let status = state.trial.call_status(&client_id);
    Ok(HttpResponse::Ok().json(status))
}

pub async fn trial_call_start(state: web::Data<AppState>, body: web::Json<TrialClient>) -> AppResult<HttpResponse> {
    let client_id = required(body.into_inner().client_id)?;

    // The session must exist before a window is charged for it.
    state.conversation.sessions().open(
        &client_id,
        TRIAL_CALL_SESSION,
        SessionKind::TrialCall,
        &SessionSettings::default(),
    )?;

    match state.trial.start_call(&client_id) {
        CallStart::Started(status) | CallStart::Resumed(status) => Ok(HttpResponse::Ok().json(json!({
            "ok": true,
            "sessions_left": status.sessions_left,
            "remaining": status.remaining
        }))),
        CallStart::Denied => Ok(HttpResponse::Forbidden().json(json!({
            "ok": false,
            "error": "no_sessions_left",
            "sessions_left": 0,
            "remaining": 0
        }))),
    }
}
