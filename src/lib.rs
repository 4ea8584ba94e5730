//! # Voice Relay Backend
//!
//! A WebSocket relay for spoken conversations. Each connected client gets a
//! session with its own dialogue identity; every audio message it sends is
//! transcribed, answered by the dialogue model, synthesized to speech and
//! sent back as one binary message.
//!
//! ## Module map:
//! - **adapters**: the three external services behind traits
//!   (transcription, dialogue, synthesis) and their HTTP implementations
//! - **pipeline**: the session lifecycle and turn loop, independent of the
//!   transport
//! - **websocket**: the actix transport that feeds the pipeline
//! - **config**, **state**, **error**: the ambient plumbing
//! - **health**, **handlers**, **middleware**: the operational HTTP surface

pub mod adapters;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod pipeline;
pub mod state;
pub mod websocket;

use actix_web::web;

/// Register every route the relay serves.
///
/// `AppState` must be provided as `web::Data` by the caller.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws", web::get().to(websocket::relay_websocket))
        .route("/health", web::get().to(health::health_check))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(handlers::get_config)),
        );
}
