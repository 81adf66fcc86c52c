use crate::config::AppConfig;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// Configuration as JSON with the API key masked.
fn redacted(config: &AppConfig) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(config).map_err(|e| AppError::Internal(e.to_string()))?;
    if let Some(remote) = value.get_mut("remote") {
        let masked = if config.remote.api_key.is_empty() { "" } else { "********" };
        remote["api_key"] = json!(masked);
    }
    Ok(value)
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)?
    })))
}

/// Partial update; persona and gain changes apply from the next call.
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
    info!(
        voice = %current_config.voice.voice_name,
        language = %current_config.voice.language_code,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; changes apply to the next call",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_masked() {
        let mut config = AppConfig::default();
        config.remote.api_key = "secret".to_string();
        let value = redacted(&config).unwrap();
        assert_eq!(value["remote"]["api_key"], "********");
        assert_eq!(value["voice"]["voice_name"], "Laomedeia");

        let value = redacted(&AppConfig::default()).unwrap();
        assert_eq!(value["remote"]["api_key"], "");
    }
}
