use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration after all sources were merged.
///
/// Read-only: the reference signal and the sink are wired at startup, so
/// changing them requires a restart.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": serde_json::to_value(config)?,
        "audio_format": state.analyzer.format()
    })))
}
