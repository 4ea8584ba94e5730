//! Session admission: allocate a dialogue identity, optionally greet, run.

use super::connection::{Closure, Connection};
use super::session::{Session, SessionOutcome, SessionReport};
use super::{interrupted, Interrupted};
use crate::adapters::{Adapters, AudioFormat, Persona};
use crate::config::AppConfig;
use crate::error::SetupError;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// What every new session starts with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub persona: Persona,
    pub greeting: Option<String>,
    pub audio_format: AudioFormat,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            persona: config.dialogue.persona(),
            greeting: config
                .session
                .greeting
                .clone()
                .filter(|text| !text.trim().is_empty()),
            audio_format: config.session.audio_format,
        }
    }
}

/// Turns accepted connections into running sessions.
///
/// Cheap to clone; every session gets the same adapters and settings plus
/// its own subscription to the shutdown signal.
#[derive(Debug, Clone)]
pub struct Gateway {
    adapters: Adapters,
    settings: Arc<SessionSettings>,
    shutdown: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(adapters: Adapters, settings: SessionSettings, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            adapters,
            settings: Arc::new(settings),
            shutdown,
        }
    }

    pub fn adapters(&self) -> &Adapters {
        &self.adapters
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Create the session's dialogue identity.
    ///
    /// On failure the connection is closed straight away, without an error
    /// notification, and no session exists.
    pub async fn open<C: Connection>(
        &self,
        session_id: Uuid,
        mut connection: C,
    ) -> Result<Session<C>, SetupError> {
        let created = {
            let persona = &self.settings.persona;
            tokio::select! {
                biased;
                interrupt = interrupted(&connection, &self.shutdown) => Err(match interrupt {
                    Interrupted::Disconnected => SetupError::Disconnected,
                    Interrupted::Shutdown => SetupError::Shutdown,
                }),
                created = self.adapters.dialogue.create_identity(persona) => created.map_err(SetupError::from),
            }
        };

        match created {
            Ok(dialogue) => {
                info!(dialogue_id = %dialogue, "session opened");
                Ok(Session::new(
                    session_id,
                    dialogue,
                    connection,
                    self.adapters.clone(),
                    self.settings.audio_format,
                    self.shutdown.clone(),
                ))
            }
            Err(err) => {
                let closure = match err {
                    SetupError::Shutdown => Closure::Shutdown,
                    SetupError::Disconnected => Closure::Normal,
                    SetupError::Identity(_) => Closure::Error,
                };
                connection.close(closure).await;
                Err(err)
            }
        }
    }

    /// Open, greet and run one session to completion.
    pub async fn serve<C: Connection>(&self, session_id: Uuid, connection: C) -> SessionReport {
        let span = info_span!("session", %session_id);
        async move {
            let mut session = match self.open(session_id, connection).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(error = %err, "session setup failed");
                    let outcome = match err {
                        SetupError::Identity(_) => SessionOutcome::SetupFailed,
                        SetupError::Disconnected => SessionOutcome::ClientClosed,
                        SetupError::Shutdown => SessionOutcome::Shutdown,
                    };
                    return SessionReport {
                        session_id,
                        opened: false,
                        turns_completed: 0,
                        outcome,
                    };
                }
            };

            if let Some(greeting) = &self.settings.greeting {
                session.greet(greeting).await;
            }

            let report = session.run().await;
            info!(turns = report.turns_completed, outcome = ?report.outcome, "session finished");
            report
        }
        .instrument(span)
        .await
    }
}
