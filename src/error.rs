//! # Error Handling
//!
//! Two families of errors live here.
//!
//! ## HTTP errors
//! [`AppError`] is returned by HTTP handlers. It implements actix's
//! `ResponseError`, so returning it from a handler produces a JSON body:
//!
//! ```json
//! {
//!   "error": {
//!     "type": "service_unavailable",
//!     "message": "session limit of 10 reached",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! ## Relay errors
//! Every boundary of the voice pipeline has its own tagged error:
//! - [`TransportError`]: the client connection
//! - [`TranscriptionError`]: speech-to-text backend
//! - [`DialogueError`]: language-model backend
//! - [`SynthesisError`]: text-to-speech backend
//! - [`SetupError`]: a session could not be opened at all
//!
//! [`SessionError`] wraps the first four. Because the variant records which
//! stage failed, the error notification sent to the client can say so.
//!
//! ## Rust Concepts
//! - **thiserror**: `#[derive(Error)]` writes the `Display` and `Error` impls
//!   from the `#[error("...")]` attributes.
//! - **#[from]**: generates a `From` impl, which is what lets `?` convert a
//!   `reqwest::Error` into a `TranscriptionError` automatically.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors returned from HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Something failed on the server side (500)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration could not be loaded or rendered (500)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The server cannot take the request right now (503).
    /// Used when the session limit is reached or shutdown has begun.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    fn kind(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.kind().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.kind();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON encoding error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// A backend answered with a non-success HTTP status.
///
/// The body is kept (truncated) because providers put the useful part of
/// the diagnosis there.
#[derive(Debug, Error)]
#[error("backend returned {status}: {body}")]
pub struct ApiFailure {
    pub status: u16,
    pub body: String,
}

impl ApiFailure {
    const MAX_BODY_CHARS: usize = 300;

    pub fn new(status: u16, body: &str) -> Self {
        let body = body.trim();
        let body = if body.chars().count() > Self::MAX_BODY_CHARS {
            let mut cut: String = body.chars().take(Self::MAX_BODY_CHARS).collect();
            cut.push_str("...");
            cut
        } else {
            body.to_string()
        };
        Self { status, body }
    }
}

/// Failures of the client connection itself.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone; nothing more can be sent or received.
    #[error("connection closed")]
    Closed,

    #[error("failed to send to client: {0}")]
    Send(String),
}

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Api(#[from] ApiFailure),
}

#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Api(#[from] ApiFailure),

    /// The backend finished the generation in a non-success state.
    #[error("run ended with status {status}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    RunFailed {
        status: String,
        detail: Option<String>,
    },

    #[error("backend produced no text reply")]
    EmptyReply,

    #[error("unrecognised dialogue identity")]
    UnknownIdentity,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Api(#[from] ApiFailure),

    /// No voice was configured and the provider offered none.
    #[error("no voice available for synthesis")]
    VoiceUnavailable,
}

/// A fatal error inside an active session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transcription failed: {0}")]
    Transcription(#[from] TranscriptionError),

    #[error("dialogue failed: {0}")]
    Dialogue(#[from] DialogueError),

    #[error("synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("server is shutting down")]
    Shutdown,
}

impl SessionError {
    /// Pipeline stage the error came from, for logs and metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            SessionError::Transport(_) => "transport",
            SessionError::Transcription(_) => "transcription",
            SessionError::Dialogue(_) => "dialogue",
            SessionError::Synthesis(_) => "synthesis",
            SessionError::Shutdown => "shutdown",
        }
    }

    /// Text placed in the error notification sent to the client.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

/// Reasons a session never became active.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not create dialogue identity: {0}")]
    Identity(#[from] DialogueError),

    #[error("client disconnected during setup")]
    Disconnected,

    #[error("server is shutting down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_names_the_failing_stage() {
        let err = SessionError::from(TranscriptionError::Api(ApiFailure::new(400, "bad audio")));
        assert_eq!(err.stage(), "transcription");
        assert_eq!(
            err.client_message(),
            "transcription failed: backend returned 400: bad audio"
        );

        let err = SessionError::from(SynthesisError::VoiceUnavailable);
        assert_eq!(err.client_message(), "synthesis failed: no voice available for synthesis");
    }

    #[test]
    fn test_run_failed_display() {
        let with_detail = DialogueError::RunFailed {
            status: "failed".to_string(),
            detail: Some("rate_limit_exceeded".to_string()),
        };
        assert_eq!(with_detail.to_string(), "run ended with status failed: rate_limit_exceeded");

        let bare = DialogueError::RunFailed {
            status: "expired".to_string(),
            detail: None,
        };
        assert_eq!(bare.to_string(), "run ended with status expired");
    }

    #[test]
    fn test_api_failure_truncates_long_bodies() {
        let failure = ApiFailure::new(502, &"x".repeat(1000));
        assert_eq!(failure.status, 502);
        assert_eq!(failure.body.chars().count(), ApiFailure::MAX_BODY_CHARS + 3);
        assert!(failure.body.ends_with("..."));
    }

    #[test]
    fn test_service_unavailable_response() {
        let err = AppError::ServiceUnavailable("session limit of 2 reached".to_string());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
