//! Session list, save and delete endpoints.

use crate::error::{AppError, AppResult};
use crate::handlers::turns::required;
use crate::session::{DisplayName, Message, SessionKind, SessionSnapshot};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SaveSessionRequest {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub name: Option<DisplayName>,
    pub messages: Option<Vec<Message>>,
    pub kind: Option<SessionKind>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSessionRequest {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

pub async fn list_sessions(state: web::Data<AppState>, query: web::Query<SessionsQuery>) -> AppResult<HttpResponse> {
    let user_id = required(query.into_inner().user_id)?;
    let sessions = state.conversation.sessions().list(&user_id)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "sessions": sessions
    })))
}

pub async fn save_session(state: web::Data<AppState>, body: web::Json<SaveSessionRequest>) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let user_id = required(body.user_id)?;
    let session_id = body
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing session_id".to_string()))?;

    let saved = state.conversation.sessions().save(
        &user_id,
        SessionSnapshot {
            session_id,
            kind: body.kind,
            name: body.name,
            messages: body.messages,
        },
    )?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "session_id": saved.id,
        "messages": saved.messages.len()
    })))
}

pub async fn delete_session(
    state: web::Data<AppState>,
    body: web::Json<DeleteSessionRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let user_id = required(body.user_id)?;
    let session_id = body
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing session_id".to_string()))?;

    let deleted = state.conversation.sessions().delete(&user_id, &session_id)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "deleted": deleted
    })))
}
