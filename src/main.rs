//! # Voice Relay Backend - Main Application Entry Point
//!
//! Starts the Actix-web server that relays spoken conversations:
//! - `GET /ws` upgrades to a relay session
//! - `/health` and `/api/v1/{health,metrics,config}` for operators
//!
//! ## Startup order:
//! 1. `.env` and logging
//! 2. Configuration (defaults, `config.toml`, environment) and validation
//! 3. HTTP clients for the transcription, dialogue and synthesis services
//! 4. Shared state, then the server
//!
//! ## Shutdown:
//! On SIGINT or SIGTERM the state flips its shutdown flag. New upgrades get
//! 503, live sessions send their goodbye and close, and the server stops
//! once they have drained or the grace period runs out.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_relay_backend::adapters::Adapters;
use voice_relay_backend::config::AppConfig;
use voice_relay_backend::middleware::MetricsMiddleware;
use voice_relay_backend::routes;
use voice_relay_backend::state::AppState;

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    for warning in config.credential_warnings() {
        warn!("{}", warning);
    }

    let adapters = Adapters::from_config(&config)?;
    info!(?adapters, "service adapters ready");

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let grace = Duration::from_millis(config.session.shutdown_grace_ms);
    let app_state = AppState::new(config, adapters);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new({
        let app_state = app_state.clone();
        move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .wrap(cors)
                .wrap(TracingLogger::default())
                .wrap(MetricsMiddleware)
                .configure(routes)
        }
    })
    // Signals are handled below so sessions can drain first
    .disable_signals()
    .bind(&bind_addr)?
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
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown signal received, closing sessions...");
            app_state.begin_shutdown();
            if !app_state.wait_for_sessions_to_drain(grace).await {
                warn!(
                    remaining = app_state.active_sessions(),
                    "sessions still open after the grace period"
                );
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured console logging, filtered by `RUST_LOG`.
///
/// Defaults to `voice_relay_backend=debug,actix_web=info` when `RUST_LOG`
/// is unset or unparsable.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT.
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
