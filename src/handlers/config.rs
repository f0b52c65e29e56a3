use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The parts of the configuration exposed over the API. The API key never
/// appears here; it lives only in the environment.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "live": {
            "endpoint": config.live.endpoint,
            "model": config.live.model,
            "voice": config.live.voice,
            "system_instruction": config.live.system_instruction,
            "setup_timeout_secs": config.live.setup_timeout_secs,
            "api_key_configured": crate::config::LiveConfig::api_key().is_some()
        },
        "audio": {
            "backend": config.audio.backend,
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate,
            "block_size": config.audio.block_size,
            "outbound_queue_capacity": config.audio.outbound_queue_capacity
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; changes apply to the next session",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
