//! # Live Assistant Backend - Main Application Entry Point
//!
//! HTTP and WebSocket server behind a voice-and-text assistant that talks to
//! a hosted generative model.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, `APP__*` environment)
//! - **state**: shared configuration, metrics, model client and chat history
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and per-endpoint metrics
//! - **handlers**: REST endpoints (chat, speech, sessions, config)
//! - **websocket**: `/ws/live`, one live voice session per browser connection
//! - **live**: session lifecycle and the remote live endpoint client
//! - **audio**: PCM conversion, capture ticks and gapless playback scheduling
//! - **genai**: REST client for text, image and speech generation
//! - **history**: chat sessions persisted to a JSON file
//! - **error**: error types and their HTTP responses

mod audio;
mod config;
mod error;
mod genai;
mod handlers;
mod health;
mod history;
mod live;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state**
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGINT / SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-assistant-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if !config.api_key_configured() {
        warn!("No API key configured; remote model calls will fail until one is set");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse registration order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::configure_api)
            .route("/ws/live", web::get().to(websocket::live_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server (usually an error) or a signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
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

/// ## Environment Variables:
/// - `RUST_LOG`: log filter, defaults to "live_assistant_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_assistant_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGTERM or Ctrl+C. If the SIGTERM handler cannot be
/// installed, only Ctrl+C is watched.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
