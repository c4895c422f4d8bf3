use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`. The API key is masked.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// `PUT /api/v1/config` with a partial document, e.g.
/// `{"turn": {"short_silence_ms": 3000}}`.
///
/// New silence thresholds apply to calls started afterwards; server
/// address and trial limit changes take effect on restart.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(updated.clone()).map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::testing::ScriptedBackend;
    use crate::state::testing::state_with;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn update_applies_partial_turn_settings() {
        let state = state_with(Arc::new(ScriptedBackend::default()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"turn": {"short_silence_ms": 3000}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().turn.short_silence_ms, 3000);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"turn": {"long_silence_ms": 1000}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["turn"]["long_silence_ms"], 10_000);
    }
}
