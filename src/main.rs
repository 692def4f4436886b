//! # Voice Relay - Main Application Entry Point
//!
//! This is the main entry point for the voice-relay server.
//! It serves a browser voice client and relays its WebSocket traffic to a hosted
//! live voice API, one upstream connection per browser connection.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection is handled by async tasks on the actix/tokio runtime
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc**: configuration and the session registry are shared by all workers
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Shared state: configuration, HTTP metrics, session registry
//! - **relay**: Upstream connection, session bridge, session bookkeeping
//! - **websocket**: The browser-facing `/ws` endpoint
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request metrics
//! - **handlers**: The client page, config view and 404 fallback
//! - **error**: Error types and how they reach clients

// Module declarations - These tell Rust about our other source files
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod relay;       // Browser <-> upstream relaying (relay/ directory)
mod state;       // Application state management (state.rs)
mod websocket;   // Browser WebSocket endpoint (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long open connections get to finish after a shutdown signal.
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** that all requests can access
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving SIGINT or SIGTERM
///
/// ## Error Handling:
/// Configuration and bind errors end the process with a message. A missing
/// upstream credential does not: the server starts, and each relay session is
/// closed with a policy-violation code until a key is configured.
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        upstream_host = %relay::upstream::endpoint_host(&config.upstream),
        model = %config.upstream.setup.model,
        max_sessions = config.relay.max_concurrent_sessions,
        "Relay configured"
    );
    if !config.has_credential() {
        warn!(
            "{} is not set; sessions will be closed until a credential is configured",
            crate::config::API_KEY_ENV
        );
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config);

    // Install signal handlers before serving so a failure is a startup error
    let sigterm = signal(SignalKind::terminate())?;
    let sigint = signal(SignalKind::interrupt())?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse registration order for requests
            .wrap(middleware::MetricsMiddleware)
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(configure_routes)
            .default_service(web::to(handlers::not_found))
    })
    .disable_signals()
    .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown(sigterm, sigint) => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Every route the server exposes, apart from the 404 fallback.
///
/// ## Routes:
/// - `GET /`: browser voice client
/// - `GET /ws`: relay WebSocket
/// - `GET /health`, `GET /api/v1/health`: liveness and upstream readiness
/// - `GET /api/v1/metrics`: request and session metrics
/// - `GET /api/v1/config`: effective configuration, credential redacted
pub(crate) fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config)),
    )
    .route("/health", web::get().to(health::health_check))
    .route("/ws", web::get().to(websocket::relay_socket))
    .route("/", web::get().to(handlers::index));
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "voice_relay=trace")
/// - If not set, defaults to "voice_relay=debug,actix_web=info"
///
/// The upstream URL carries the credential in its query string, so nothing in
/// this crate logs it; only the host is ever recorded.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on the first SIGTERM or SIGINT (Ctrl+C).
async fn wait_for_shutdown(mut sigterm: Signal, mut sigint: Signal) {
    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}
