//! # Call Bridge Backend - Main Application Entry Point
//!
//! Entry point for the call-bridge-backend server: a real-time audio bridge
//! between a telephony provider's media streams and a conversational AI
//! voice agent.
//!
//! ## Application Architecture:
//! - **config**: application configuration (TOML files + environment variables)
//! - **state**: shared state, metrics, and the injected service objects
//! - **audio**: mu-law/PCM transcoding and the outbound message queue
//! - **call**: session data model and the owning registry
//! - **bridge**: per-call state machine and the media-stream WebSocket actor
//! - **resilience**: reconnect supervisor, agent link, circuit breaker, fallback
//! - **telephony**: provider REST client, webhook signatures, markup responses
//! - **health / middleware / handlers**: HTTP surface
//!
//! ## Request Flow:
//! The provider POSTs `/call/incoming` and is answered with markup opening
//! a media stream to `/call/stream`; each stream connection becomes one
//! call actor that dials the agent and pumps audio both ways.

mod audio;       // Transcoding and buffering
mod bridge;      // Per-call orchestration
mod call;        // Session state and registry
mod clock;       // Injectable time source
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod resilience;  // Reconnect, breaker, fallback
mod state;       // Application state management (state.rs)
mod telephony;   // Provider client and webhooks

use actix_cors::Cors;
use actix_web::{web, App, HttpServer, middleware::Logger};
use anyhow::Result;
use crate::config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal set by the SIGTERM/SIGINT handlers so the server
/// can finish in-flight requests before stopping.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let app_config = AppConfig::load()?;
    app_config.validate()?;

    info!("Starting call-bridge-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        app_config.server.host, app_config.server.port
    );

    // All long-lived services (registry, breaker, telephony client,
    // fallback controller) are constructed once here; credential problems
    // abort startup instead of surfacing mid-call.
    let app_state = match AppState::new(app_config.clone()) {
        Ok(state) => state,
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(anyhow::anyhow!(e.to_string()));
        }
    };
    let bind_addr = format!("{}:{}", app_config.server.host, app_config.server.port);

    setup_signal_handlers();
    spawn_session_sweeper(&app_state, &app_config);

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // Telephony provider surface
            .route("/call/incoming", web::post().to(handlers::incoming_call))
            .route("/call/stream", web::get().to(bridge::stream::media_stream))
            // Operator surface
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged; defaults to
///   `call_bridge_backend=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_bridge_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically remove sessions whose termination event was missed.
///
/// A dropped media socket normally tears its session down, but a missed
/// `stop` plus a crashed actor would leak the entry forever; the sweep
/// bounds that.
fn spawn_session_sweeper(app_state: &AppState, app_config: &AppConfig) {
    let registry = app_state.registry.clone();
    let sweep_interval = Duration::from_millis(app_config.bridge.sweep_interval_ms);
    let max_age = Duration::from_millis(app_config.bridge.session_max_age_ms);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        // The first tick completes immediately; skip it
        interval.tick().await;

        loop {
            interval.tick().await;
            let report = registry.sweep(max_age);
            for err in &report.errors {
                warn!("Session sweep cleanup error: {}", err);
            }
        }
    });
}

/// Set up signal handlers for graceful shutdown (SIGTERM, SIGINT).
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
