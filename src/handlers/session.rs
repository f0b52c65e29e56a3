use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::{error, info, warn};

/// `POST /api/v1/session/connect`
///
/// Resolves once the session is streaming (or already active). Microphone
/// refusal maps to 403, an unreachable endpoint to 502 and a missing output
/// device to 503.
pub async fn connect(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    match state.session.connect().await {
        Ok(outcome) => {
            if outcome.started {
                state.record_session_start(true);
            }
            info!(state = outcome.state.as_str(), started = outcome.started, "Session connect requested");
            Ok(HttpResponse::Ok().json(json!({
                "state": outcome.state,
                "started": outcome.started,
                "session_id": state.session.snapshot().session_id,
                "timestamp": chrono::Utc::now().to_rfc3339()
            })))
        }
        Err(err) => {
            state.record_session_start(false);
            if err.is_user_visible() {
                warn!(code = err.code(), "Session connect failed: {}", err);
            } else {
                error!(code = err.code(), "Session connect failed unexpectedly: {}", err);
            }
            Err(err.into())
        }
    }
}

/// `POST /api/v1/session/disconnect`
pub async fn disconnect(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.disconnect();

    Ok(HttpResponse::Ok().json(json!({
        "state": state.session.state(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// `POST /api/v1/session/interrupt`
pub async fn interrupt(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.interrupt();

    Ok(HttpResponse::Ok().json(json!({
        "state": state.session.state(),
        "pending_buffers": state.session.snapshot().pending_buffers,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// `GET /api/v1/session`
pub async fn status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    })))
}
