use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Read the runtime configuration. Credentials are masked; this endpoint
/// exists for operators, not for credential recovery.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port,
                "external_url": config.server.external_url
            },
            "telephony": {
                "account_id": config.telephony.account_id,
                "secret": "********",
                "api_base_url": config.telephony.api_base_url,
                "validate_signatures": config.telephony.validate_signatures
            },
            "agent": {
                "ws_url": config.agent.ws_url,
                "agent_id": config.agent.agent_id,
                "audio_format": config.agent.audio_format.as_str()
            },
            "bridge": {
                "execution_mode": config.bridge.execution_mode,
                "heartbeat_interval_ms": config.bridge.heartbeat_interval_ms,
                "heartbeat_miss_limit": config.bridge.heartbeat_miss_limit,
                "inactivity_timeout_ms": config.bridge.inactivity_timeout_ms,
                "connect_timeout_ms": config.bridge.connect_timeout_ms,
                "queue_max_depth": config.bridge.queue_max_depth,
                "queue_expiration_ms": config.bridge.queue_expiration_ms,
                "reconnect_max_attempts": config.bridge.reconnect_max_attempts,
                "recovery_budget_ms": config.bridge.recovery_budget_ms,
                "breaker_threshold": config.bridge.breaker_threshold,
                "breaker_cooldown_ms": config.bridge.breaker_cooldown_ms
            },
            "performance": {
                "max_concurrent_calls": config.performance.max_concurrent_calls
            }
        }
    })))
}

/// Apply a partial configuration update at runtime.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::BadRequest)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": {
            "server": {
                "host": current_config.server.host,
                "port": current_config.server.port,
                "external_url": current_config.server.external_url
            },
            "bridge": {
                "heartbeat_interval_ms": current_config.bridge.heartbeat_interval_ms,
                "inactivity_timeout_ms": current_config.bridge.inactivity_timeout_ms,
                "connect_timeout_ms": current_config.bridge.connect_timeout_ms,
                "queue_max_depth": current_config.bridge.queue_max_depth,
                "queue_expiration_ms": current_config.bridge.queue_expiration_ms,
                "recovery_budget_ms": current_config.bridge.recovery_budget_ms
            },
            "performance": {
                "max_concurrent_calls": current_config.performance.max_concurrent_calls
            }
        }
    })))
}
