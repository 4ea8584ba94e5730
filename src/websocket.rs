//! # WebSocket Relay Endpoint
//!
//! Clients connect to `/ws`. Each connection becomes one conversation
//! session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server allocates a dialogue identity; if that fails
//!    the socket is closed with code 1011 and nothing else is sent
//! 2. **Greeting**: if configured, one binary audio message arrives first
//! 3. **Turns**: the client sends one binary message per utterance (a whole
//!    recording, e.g. a WebM blob) and receives one binary audio reply
//! 4. **Errors**: `{"type":"error","message":"..."}` as a text message,
//!    followed by a close frame
//!
//! Text messages from the client are ignored. Fragmented binary messages are
//! reassembled here, so the session always sees whole buffers.
//!
//! ## Architecture
//! The actor ([`RelaySocket`]) only moves bytes. The session runs in its
//! own tokio task and talks to the actor through [`SocketConnection`]:
//! - client audio flows through a bounded `mpsc` channel
//! - replies, notices and close requests go back as actor messages
//! - a `watch` channel flips to `true` when the actor stops, which is how
//!   the session learns that the client is gone

use crate::config::SessionConfig;
use crate::error::{AppError, TransportError};
use crate::pipeline::{Closure, Connection, Inbound};
use crate::state::{AppState, SessionPermit};

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws::{self, CloseCode, CloseReason};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Structured messages the server sends as WebSocket text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    Error { message: String },
}

#[derive(Message)]
#[rtype(result = "()")]
struct OutboundAudio(Vec<u8>);

#[derive(Message)]
#[rtype(result = "()")]
struct OutboundNotice(ServerNotice);

#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket(Closure);

fn close_code(closure: Closure) -> CloseCode {
    match closure {
        Closure::Normal => CloseCode::Normal,
        Closure::Error => CloseCode::Error,
        Closure::Shutdown => CloseCode::Away,
    }
}

/// Progress through a fragmented client message.
#[derive(Debug)]
enum Reassembly {
    Idle,
    Binary(Vec<u8>),
    /// Fragmented text; dropped like any other client text
    Text,
}

/// Actor owning one client WebSocket.
pub struct RelaySocket {
    session_id: Uuid,
    state: AppState,
    permit: Option<SessionPermit>,
    inbound_tx: Option<mpsc::Sender<Vec<u8>>>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    fragments: Reassembly,
    max_message_bytes: usize,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(state: AppState, permit: SessionPermit, config: &SessionConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth);
        let (closed, _) = watch::channel(false);

        Self {
            session_id: Uuid::new_v4(),
            state,
            permit: Some(permit),
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            closed,
            fragments: Reassembly::Idle,
            max_message_bytes: config.max_message_bytes,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn reject(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: CloseCode, why: &str) {
        warn!(session_id = %self.session_id, reason = why, "closing websocket");
        self.fragments = Reassembly::Idle;
        ctx.close(Some(CloseReason {
            code,
            description: Some(why.to_string()),
        }));
        ctx.stop();
    }

    /// Hand one complete audio message to the session.
    fn deliver(&mut self, audio: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound_tx else {
            return;
        };
        match inbound.try_send(audio) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.reject(ctx, CloseCode::Policy, "too many audio messages waiting for a reply")
            }
            Err(TrySendError::Closed(_)) => debug!("session no longer reading audio"),
        }
    }

    fn continuation(&mut self, item: Item, ctx: &mut ws::WebsocketContext<Self>) {
        match item {
            Item::FirstBinary(chunk) => {
                self.fragments = Reassembly::Binary(Vec::new());
                self.append(&chunk, ctx);
            }
            Item::FirstText(_) => self.fragments = Reassembly::Text,
            Item::Continue(chunk) => {
                self.append(&chunk, ctx);
            }
            Item::Last(chunk) => {
                if !self.append(&chunk, ctx) {
                    return;
                }
                match std::mem::replace(&mut self.fragments, Reassembly::Idle) {
                    Reassembly::Binary(audio) => self.deliver(audio, ctx),
                    Reassembly::Text => debug!("ignoring fragmented text message from client"),
                    Reassembly::Idle => warn!("continuation frame without a first frame"),
                }
            }
        }
    }

    /// Returns false if the connection was closed for exceeding the size limit.
    fn append(&mut self, chunk: &[u8], ctx: &mut ws::WebsocketContext<Self>) -> bool {
        let too_large = match &self.fragments {
            Reassembly::Binary(audio) => audio.len() + chunk.len() > self.max_message_bytes,
            _ => false,
        };
        if too_large {
            self.reject(ctx, CloseCode::Size, "audio message too large");
            return false;
        }
        if let Reassembly::Binary(audio) = &mut self.fragments {
            audio.extend_from_slice(chunk);
        }
        true
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "websocket connection started");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "websocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let Some(inbound) = self.inbound_rx.take() else {
            return;
        };
        let connection = SocketConnection {
            inbound,
            closed: self.closed.subscribe(),
            addr: ctx.address(),
        };
        let gateway = self.state.gateway();
        let state = self.state.clone();
        let permit = self.permit.take();
        let session_id = self.session_id;

        tokio::spawn(async move {
            let report = gateway.serve(session_id, connection).await;
            state.record_session(&report);
            drop(permit);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound_tx = None;
        self.closed.send_replace(true);
        info!(session_id = %self.session_id, "websocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(ws::ProtocolError::Overflow) => {
                self.reject(ctx, CloseCode::Size, "audio message too large");
                return;
            }
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "websocket protocol error");
                ctx.stop();
                return;
            }
        };
        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Binary(data) => {
                if !matches!(self.fragments, Reassembly::Idle) {
                    warn!("binary frame interrupted a fragmented message");
                    self.fragments = Reassembly::Idle;
                }
                self.deliver(data.to_vec(), ctx);
            }
            ws::Message::Continuation(item) => self.continuation(item, ctx),
            ws::Message::Text(text) => {
                debug!(chars = text.len(), "ignoring text message from client");
            }
            ws::Message::Ping(data) => ctx.pong(&data),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                info!(session_id = %self.session_id, ?reason, "client closed websocket");
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Nop => {}
        }
    }
}

impl Handler<OutboundAudio> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundAudio, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<OutboundNotice> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundNotice, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg.0) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "failed to encode server notice"),
        }
    }
}

impl Handler<CloseSocket> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(CloseReason::from(close_code(msg.0))));
        ctx.stop();
    }
}

/// A mailbox error after the actor stopped is an ordinary disconnect;
/// anything else means the socket broke while still open.
fn mailbox_failure(err: MailboxError, closed: bool) -> TransportError {
    if closed {
        TransportError::Closed
    } else {
        TransportError::Send(err.to_string())
    }
}

/// The session's view of a [`RelaySocket`].
pub struct SocketConnection {
    inbound: mpsc::Receiver<Vec<u8>>,
    closed: watch::Receiver<bool>,
    addr: Addr<RelaySocket>,
}

impl SocketConnection {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Send an actor message unless the socket goes away first.
    async fn dispatch<M>(&self, msg: M) -> Result<(), TransportError>
    where
        M: Message<Result = ()> + Send + 'static,
        RelaySocket: Handler<M>,
    {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            sent = self.addr.send(msg) => sent.map_err(|err| mailbox_failure(err, self.is_closed())),
        }
    }
}

#[async_trait]
impl Connection for SocketConnection {
    async fn receive(&mut self) -> Result<Inbound, TransportError> {
        if self.is_closed() {
            return Ok(Inbound::Closed);
        }
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Ok(Inbound::Closed),
            audio = self.inbound.recv() => Ok(audio.map_or(Inbound::Closed, Inbound::Audio)),
        }
    }

    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<(), TransportError> {
        self.dispatch(OutboundAudio(audio)).await
    }

    async fn send_error(&mut self, message: &str) -> Result<(), TransportError> {
        self.dispatch(OutboundNotice(ServerNotice::Error {
            message: message.to_string(),
        }))
        .await
    }

    async fn close(&mut self, closure: Closure) {
        if let Err(err) = self.dispatch(CloseSocket(closure)).await {
            debug!(error = %err, "websocket already closed");
        }
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Upgrade `GET /ws` to a relay session.
///
/// Refused with 503 while shutting down or when the session limit is reached.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    if state.is_shutting_down() {
        return Err(AppError::ServiceUnavailable("server is shutting down".to_string()).into());
    }

    let config = state.config();
    let permit = state.try_reserve_session().ok_or_else(|| {
        AppError::ServiceUnavailable(format!(
            "session limit of {} reached",
            config.session.max_concurrent_sessions
        ))
    })?;

    let socket = RelaySocket::new(state.get_ref().clone(), permit, &config.session);
    info!(
        session_id = %socket.session_id(),
        peer = ?req.connection_info().peer_addr(),
        "websocket upgrade requested"
    );

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(config.session.max_message_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_notice_wire_format() {
        let notice = ServerNotice::Error {
            message: "transcription failed: backend returned 500: boom".to_string(),
        };

        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "error",
                "message": "transcription failed: backend returned 500: boom"
            })
        );

        let parsed: ServerNotice = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, notice);
    }

    #[test]
    fn test_mailbox_failure_while_open_is_a_transport_error() {
        assert!(matches!(
            mailbox_failure(MailboxError::Closed, true),
            TransportError::Closed
        ));
        assert!(matches!(
            mailbox_failure(MailboxError::Closed, false),
            TransportError::Send(_)
        ));
        assert!(matches!(
            mailbox_failure(MailboxError::Timeout, false),
            TransportError::Send(_)
        ));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code(Closure::Normal), CloseCode::Normal);
        assert_eq!(close_code(Closure::Error), CloseCode::Error);
        assert_eq!(close_code(Closure::Shutdown), CloseCode::Away);
    }
}
