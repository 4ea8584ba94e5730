//! # Session and Turn Loop
//!
//! A [`Session`] owns one client connection and one dialogue identity. It
//! runs turns strictly one after another. Each turn receives a complete
//! audio buffer, transcribes it, generates a reply, synthesizes the reply,
//! and sends the audio back before the next buffer is read.
//!
//! ## Failure rules
//! - Any adapter error ends the session. There is no retry and no partial
//!   turn recovery.
//! - An error ending sends exactly one notification, then closes.
//! - A client disconnect ends the session without a notification.
//! - Shutdown is reported to the client like an error, so it knows the
//!   disconnect was not its fault.
//! - [`Session::close`] is idempotent.
//!
//! ## Rust Concepts
//! - **Generic over `C: Connection`**: the WebSocket and the test double share
//!   this code without dynamic dispatch.
//! - **tokio::select! with `biased`**: each stage races the adapter call
//!   against the interruptions. Polling interruptions first means an
//!   interruption wins when both are ready.

use super::connection::{Closure, Connection, Inbound};
use super::{interrupted, shutdown_signalled, Interrupted};
use crate::adapters::{Adapters, AudioFormat, DialogueId};
use crate::error::{SessionError, TransportError};
use std::future::Future;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the turn loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingInput,
    Transcribing,
    Generating,
    Synthesizing,
    Sending,
    Terminating,
    Closed,
}

/// Coarse lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Terminating,
    Closed,
}

impl Phase {
    pub fn state(self) -> SessionState {
        match self {
            Phase::Terminating => SessionState::Terminating,
            Phase::Closed => SessionState::Closed,
            _ => SessionState::Active,
        }
    }
}

/// Why a session is ending.
#[derive(Debug)]
pub enum EndReason {
    ClientClosed,
    Failed(SessionError),
}

impl From<Interrupted> for EndReason {
    fn from(interrupt: Interrupted) -> Self {
        match interrupt {
            Interrupted::Disconnected => EndReason::ClientClosed,
            Interrupted::Shutdown => EndReason::Failed(SessionError::Shutdown),
        }
    }
}

impl From<TransportError> for EndReason {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => EndReason::ClientClosed,
            other => EndReason::Failed(SessionError::Transport(other)),
        }
    }
}

/// Result of driving one turn (or the greeting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Reply sent; the session is waiting for input again
    Completed,
    /// The session is closed
    Ended,
}

/// How a session finished, for logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    SetupFailed,
    ClientClosed,
    Failed { stage: &'static str },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    /// Whether the session ever became active
    pub opened: bool,
    pub turns_completed: u64,
    pub outcome: SessionOutcome,
}

/// Run `work` unless the client leaves or shutdown starts first.
async fn guarded<C, T, E, F>(
    connection: &C,
    shutdown: &watch::Receiver<bool>,
    work: F,
) -> Result<T, EndReason>
where
    C: Connection,
    F: Future<Output = Result<T, E>>,
    SessionError: From<E>,
{
    tokio::select! {
        biased;
        interrupt = interrupted(connection, shutdown) => Err(interrupt.into()),
        result = work => result.map_err(|err| EndReason::Failed(err.into())),
    }
}

pub struct Session<C: Connection> {
    id: Uuid,
    dialogue: DialogueId,
    connection: C,
    adapters: Adapters,
    audio_format: AudioFormat,
    shutdown: watch::Receiver<bool>,
    phase: Phase,
    turns_completed: u64,
    outcome: Option<SessionOutcome>,
}

impl<C: Connection> Session<C> {
    pub fn new(
        id: Uuid,
        dialogue: DialogueId,
        connection: C,
        adapters: Adapters,
        audio_format: AudioFormat,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            dialogue,
            connection,
            adapters,
            audio_format,
            shutdown,
            phase: Phase::AwaitingInput,
            turns_completed: 0,
            outcome: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dialogue_id(&self) -> &DialogueId {
        &self.dialogue
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed
    }

    /// Drive turns until the session closes.
    pub async fn run(mut self) -> SessionReport {
        while self.run_turn().await == TurnOutcome::Completed {}
        self.report()
    }

    /// Drive exactly one turn. A closed session accepts no further input.
    pub async fn run_turn(&mut self) -> TurnOutcome {
        if self.state() != SessionState::Active {
            return TurnOutcome::Ended;
        }
        let result = self.turn().await;
        if result.is_ok() {
            self.turns_completed += 1;
        }
        self.settle(result).await
    }

    /// Speak `text` before the first turn.
    pub async fn greet(&mut self, text: &str) -> TurnOutcome {
        if self.state() != SessionState::Active {
            return TurnOutcome::Ended;
        }
        let result = self.speak(text).await.map(|bytes| {
            debug!(bytes, "greeting sent");
        });
        self.settle(result).await
    }

    /// End the session: notify on error, then close the transport.
    /// Only the first call has any effect.
    pub async fn close(&mut self, reason: EndReason) {
        if matches!(self.phase, Phase::Terminating | Phase::Closed) {
            return;
        }
        self.enter(Phase::Terminating);

        let (closure, outcome) = match &reason {
            EndReason::ClientClosed => (Closure::Normal, SessionOutcome::ClientClosed),
            EndReason::Failed(SessionError::Shutdown) => (Closure::Shutdown, SessionOutcome::Shutdown),
            EndReason::Failed(err) => (Closure::Error, SessionOutcome::Failed { stage: err.stage() }),
        };

        match &reason {
            EndReason::ClientClosed => info!(turns = self.turns_completed, "client disconnected"),
            EndReason::Failed(err) => {
                warn!(stage = err.stage(), error = %err, turns = self.turns_completed, "session ending with error");
                if let Err(send_err) = self.connection.send_error(&err.client_message()).await {
                    debug!(error = %send_err, "error notification not delivered");
                }
            }
        }

        self.connection.close(closure).await;
        self.outcome = Some(outcome);
        self.enter(Phase::Closed);
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.id,
            opened: true,
            turns_completed: self.turns_completed,
            outcome: self.outcome.clone().unwrap_or(SessionOutcome::ClientClosed),
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
        }
    }

    async fn settle(&mut self, result: Result<(), EndReason>) -> TurnOutcome {
        match result {
            Ok(()) => {
                self.enter(Phase::AwaitingInput);
                TurnOutcome::Completed
            }
            Err(reason) => {
                self.close(reason).await;
                TurnOutcome::Ended
            }
        }
    }

    async fn turn(&mut self) -> Result<(), EndReason> {
        self.enter(Phase::AwaitingInput);
        let audio = self.next_audio().await?;
        let started = Instant::now();

        self.enter(Phase::Transcribing);
        let text = guarded(
            &self.connection,
            &self.shutdown,
            self.adapters.transcriber.transcribe(&audio, self.audio_format),
        )
        .await?;
        let transcribed_at = started.elapsed();

        self.enter(Phase::Generating);
        let reply = guarded(
            &self.connection,
            &self.shutdown,
            self.adapters.dialogue.generate_reply(&self.dialogue, &text),
        )
        .await?;
        let generated_at = started.elapsed();

        let reply_bytes = self.speak(&reply).await?;

        info!(
            turn = self.turns_completed + 1,
            audio_bytes = audio.len(),
            transcript_chars = text.chars().count(),
            reply_chars = reply.chars().count(),
            reply_bytes,
            transcribe_ms = transcribed_at.as_millis() as u64,
            generate_ms = (generated_at - transcribed_at).as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "turn completed"
        );
        Ok(())
    }

    async fn next_audio(&mut self) -> Result<Vec<u8>, EndReason> {
        let mut shutdown = self.shutdown.clone();
        let inbound = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => return Err(EndReason::Failed(SessionError::Shutdown)),
            inbound = self.connection.receive() => inbound?,
        };

        match inbound {
            Inbound::Audio(audio) => {
                debug!(bytes = audio.len(), "audio received");
                Ok(audio)
            }
            Inbound::Closed => Err(EndReason::ClientClosed),
        }
    }

    /// Synthesize `text` and send it. Returns the number of audio bytes sent.
    async fn speak(&mut self, text: &str) -> Result<usize, EndReason> {
        self.enter(Phase::Synthesizing);
        let audio = guarded(
            &self.connection,
            &self.shutdown,
            self.adapters.synthesizer.synthesize(text),
        )
        .await?;

        self.enter(Phase::Sending);
        let bytes = audio.len();
        self.connection.send_audio(audio).await?;
        Ok(bytes)
    }
}
