//! In-memory connection and scripted adapters for pipeline tests.

use super::connection::{Closure, Connection, Inbound};
use crate::adapters::{Adapters, AudioFormat, Dialogue, DialogueId, Persona, Synthesizer, Transcriber};
use crate::error::{ApiFailure, DialogueError, SynthesisError, TranscriptionError, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

/// One thing the scripted client does when the session reads.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Audio(Vec<u8>),
    Disconnect,
    /// From here on every send fails while the socket still looks open
    BreakOutbound,
}

/// Everything the session wrote to the connection, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
    Audio(Vec<u8>),
    Error(String),
    Close(Closure),
}

/// Plays back a script of client actions. When the script runs out the
/// client stays connected and silent until [`ConnectionProbe::disconnect`].
pub(crate) struct ScriptedConnection {
    script: VecDeque<Step>,
    outbound_broken: bool,
    sent: Arc<Mutex<Vec<Sent>>>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

/// Test-side handle onto a [`ScriptedConnection`].
#[derive(Clone)]
pub(crate) struct ConnectionProbe {
    sent: Arc<Mutex<Vec<Sent>>>,
    closed_tx: Arc<watch::Sender<bool>>,
}

pub(crate) fn scripted(steps: Vec<Step>) -> (ScriptedConnection, ConnectionProbe) {
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    let sent = Arc::new(Mutex::new(Vec::new()));

    let connection = ScriptedConnection {
        script: steps.into(),
        outbound_broken: false,
        sent: Arc::clone(&sent),
        closed_tx: Arc::clone(&closed_tx),
        closed_rx,
    };
    (connection, ConnectionProbe { sent, closed_tx })
}

impl ConnectionProbe {
    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn disconnect(&self) {
        self.closed_tx.send_replace(true);
    }
}

impl ScriptedConnection {
    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn record(&self, sent: Sent) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.outbound_broken {
            return Err(TransportError::Send("broken pipe".to_string()));
        }
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn receive(&mut self) -> Result<Inbound, TransportError> {
        if self.is_closed() {
            return Ok(Inbound::Closed);
        }
        loop {
            match self.script.pop_front() {
                Some(Step::Audio(audio)) => return Ok(Inbound::Audio(audio)),
                Some(Step::BreakOutbound) => self.outbound_broken = true,
                Some(Step::Disconnect) => {
                    self.closed_tx.send_replace(true);
                    return Ok(Inbound::Closed);
                }
                None => {
                    self.closed().await;
                    return Ok(Inbound::Closed);
                }
            }
        }
    }

    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<(), TransportError> {
        self.record(Sent::Audio(audio))
    }

    async fn send_error(&mut self, message: &str) -> Result<(), TransportError> {
        self.record(Sent::Error(message.to_string()))
    }

    async fn close(&mut self, closure: Closure) {
        self.sent.lock().unwrap().push(Sent::Close(closure));
        self.closed_tx.send_replace(true);
    }

    async fn closed(&self) {
        let mut closed = self.closed_rx.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Shared call log for the fake adapters.
#[derive(Default)]
pub(crate) struct Recorder {
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stalled: Notify,
}

/// Marks one adapter call as in flight until dropped.
pub(crate) struct InFlight<'a>(&'a Recorder);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Recorder {
    fn enter(&self, call: String) -> InFlight<'_> {
        self.calls.lock().unwrap().push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    async fn stall<T>(&self) -> T {
        self.stalled.notify_one();
        std::future::pending().await
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once some adapter call has stalled.
    pub(crate) async fn wait_for_stall(&self) {
        self.stalled.notified().await;
    }
}

/// How a fake adapter answers.
#[derive(Debug, Clone)]
pub(crate) enum Behavior<T> {
    Return(T),
    /// Derive the answer from the input
    Echo,
    Fail,
    /// Never answer
    Stall,
}

/// A configurable set of fake adapters sharing one [`Recorder`].
///
/// With every behavior on `Echo`: the transcript is the audio bytes as text,
/// the reply is `"<dialogue id> heard <transcript>"`, and the audio is the
/// reply text as bytes.
pub(crate) struct Fakes {
    pub recorder: Arc<Recorder>,
    pub transcriber: Behavior<String>,
    pub identity: Behavior<()>,
    pub dialogue: Behavior<String>,
    pub synthesizer: Behavior<Vec<u8>>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            transcriber: Behavior::Echo,
            identity: Behavior::Echo,
            dialogue: Behavior::Echo,
            synthesizer: Behavior::Echo,
        }
    }
}

impl Fakes {
    pub(crate) fn adapters(&self) -> Adapters {
        Adapters::new(
            Arc::new(FakeTranscriber {
                recorder: Arc::clone(&self.recorder),
                behavior: self.transcriber.clone(),
            }),
            Arc::new(FakeDialogue {
                recorder: Arc::clone(&self.recorder),
                identity: self.identity.clone(),
                behavior: self.dialogue.clone(),
                issued: AtomicUsize::new(0),
            }),
            Arc::new(FakeSynthesizer {
                recorder: Arc::clone(&self.recorder),
                behavior: self.synthesizer.clone(),
            }),
        )
    }
}

fn backend_down() -> ApiFailure {
    ApiFailure::new(500, "backend exploded")
}

struct FakeTranscriber {
    recorder: Arc<Recorder>,
    behavior: Behavior<String>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &[u8], _format: AudioFormat) -> Result<String, TranscriptionError> {
        let heard = String::from_utf8_lossy(audio).into_owned();
        let _call = self.recorder.enter(format!("transcribe:{heard}"));
        tokio::task::yield_now().await;
        match &self.behavior {
            Behavior::Return(text) => Ok(text.clone()),
            Behavior::Echo => Ok(heard),
            Behavior::Fail => Err(backend_down().into()),
            Behavior::Stall => self.recorder.stall().await,
        }
    }

    fn model_name(&self) -> &str {
        "fake-transcriber"
    }
}

struct FakeDialogue {
    recorder: Arc<Recorder>,
    identity: Behavior<()>,
    behavior: Behavior<String>,
    issued: AtomicUsize,
}

#[async_trait]
impl Dialogue for FakeDialogue {
    async fn create_identity(&self, persona: &Persona) -> Result<DialogueId, DialogueError> {
        let _call = self.recorder.enter(format!("identity:{}", persona.name));
        tokio::task::yield_now().await;
        match &self.identity {
            Behavior::Return(()) | Behavior::Echo => {
                let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(DialogueId::new(format!("dialogue-{n}")))
            }
            Behavior::Fail => Err(backend_down().into()),
            Behavior::Stall => self.recorder.stall().await,
        }
    }

    async fn generate_reply(&self, id: &DialogueId, user_text: &str) -> Result<String, DialogueError> {
        let _call = self.recorder.enter(format!("reply:{id}:{user_text}"));
        tokio::task::yield_now().await;
        match &self.behavior {
            Behavior::Return(reply) => Ok(reply.clone()),
            Behavior::Echo => Ok(format!("{id} heard {user_text}")),
            Behavior::Fail => Err(backend_down().into()),
            Behavior::Stall => self.recorder.stall().await,
        }
    }

    fn model_name(&self) -> &str {
        "fake-dialogue"
    }
}

struct FakeSynthesizer {
    recorder: Arc<Recorder>,
    behavior: Behavior<Vec<u8>>,
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let _call = self.recorder.enter(format!("synthesize:{text}"));
        tokio::task::yield_now().await;
        match &self.behavior {
            Behavior::Return(audio) => Ok(audio.clone()),
            Behavior::Echo => Ok(text.as_bytes().to_vec()),
            Behavior::Fail => Err(backend_down().into()),
            Behavior::Stall => self.recorder.stall().await,
        }
    }

    fn model_name(&self) -> &str {
        "fake-synthesizer"
    }
}
