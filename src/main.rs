//! # Duplex Voice Backend - Main Application Entry Point
//!
//! A real-time voice bridge between the local microphone/speakers and a remote
//! conversational audio engine, controlled over a small HTTP API.
//!
//! ## Application Architecture:
//! - **audio**: capture, wire codec, playback mixer and scheduler
//! - **session**: call controller and the remote live session transport
//! - **device**: audio device selection
//! - **config**: configuration (TOML file + environment variables)
//! - **state**: shared HTTP state and request metrics
//! - **handlers** / **health** / **websocket**: the control surface
//! - **middleware**: request metrics
//! - **error**: pipeline and HTTP error types
//!
//! ## Threads:
//! Actix runs the HTTP workers. The call controller runs on a dedicated
//! thread with its own single-threaded runtime, since audio streams are bound
//! to the thread that opened them.

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::LevelTaps;
use config::AppConfig;
use state::AppState;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.remote.api_key.is_empty() {
        warn!("No API key configured; set GEMINI_API_KEY before starting a call");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let shared_config = Arc::new(RwLock::new(config));

    let call = session::controller::spawn(shared_config.clone(), LevelTaps::default())?;
    let app_state = AppState::new(shared_config, call.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/call", web::get().to(handlers::call_status))
                    .route("/call/start", web::post().to(handlers::start_call))
                    .route("/call/end", web::post().to(handlers::end_call))
                    .route("/call/levels", web::get().to(handlers::call_levels)),
            )
            .route("/ws/call", web::get().to(websocket::call_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, ending call and stopping server...");
            call.shutdown().await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duplex_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
