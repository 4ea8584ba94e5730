//! # Voice Relay Pipeline
//!
//! One session per client connection. A session repeats the same turn until
//! the connection ends:
//!
//! ```text
//! AwaitingInput -> Transcribing -> Generating -> Synthesizing -> Sending -> AwaitingInput
//!        \______________\______________\______________\____________\
//!                                                          Terminating -> Closed
//! ```
//!
//! - [`connection`]: the transport contract the session reads from and writes to
//! - [`session`]: the turn state machine
//! - [`gateway`]: opens sessions (dialogue identity, greeting) and runs them
//!
//! Every await inside a turn also listens for two interruptions: the client
//! going away and server shutdown. Whichever fires first abandons the
//! in-flight adapter call by dropping its future.

pub mod connection;
pub mod gateway;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Closure, Connection, Inbound};
pub use gateway::{Gateway, SessionSettings};
pub use session::{EndReason, Phase, Session, SessionOutcome, SessionReport, SessionState, TurnOutcome};

use tokio::sync::watch;

/// Why an in-flight wait was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Disconnected,
    Shutdown,
}

/// Resolves once shutdown is signalled. A dropped sender means nobody can
/// ever signal, so that case never resolves.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves when either interruption happens.
pub(crate) async fn interrupted<C: Connection + ?Sized>(
    connection: &C,
    shutdown: &watch::Receiver<bool>,
) -> Interrupted {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        biased;
        _ = shutdown_signalled(&mut shutdown) => Interrupted::Shutdown,
        _ = connection.closed() => Interrupted::Disconnected,
    }
}
