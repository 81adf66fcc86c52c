use crate::device::DeviceManager;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let call = state.call.snapshot();

    // Device enumeration can be slow on some hosts
    let devices = web::block(DeviceManager::inventory).await.ok();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        },
        "call": {
            "state": call.state,
            "is_call_active": call.is_call_active,
            "status": call.status,
            "error": call.error
        },
        "remote": {
            "model": config.remote.model,
            "api_key_configured": !config.remote.api_key.is_empty()
        },
        "audio": {
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate,
            "block_size": config.audio.block_size,
            "devices": devices
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let call = state.call.snapshot();
    let levels = state.call.levels();

    let endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "call": {
            "state": call.state,
            "active_buffers": call.active_buffers,
            "next_start_time": call.next_start_time,
            "stats": call.stats,
            "input_level": levels.input_level,
            "output_level": levels.output_level
        }
    }))
}
