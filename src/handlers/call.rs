//! Call control endpoints used by the UI.
//!
//! - `POST /api/v1/call/start`: begin a call (409 if one is already running)
//! - `POST /api/v1/call/end`: end the call, always succeeds
//! - `GET /api/v1/call`: current state, status line and error line
//! - `GET /api/v1/call/levels`: input/output RMS for a level meter

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn start_call(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Call start requested");
    let snapshot = state.call.start_call().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

pub async fn end_call(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Call end requested");
    let snapshot = state.call.end_call().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

pub async fn call_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.call.snapshot())
}

pub async fn call_levels(state: web::Data<AppState>) -> HttpResponse {
    let levels = state.call.levels();
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "input_level": levels.input_level,
        "output_level": levels.output_level
    }))
}
