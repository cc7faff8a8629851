//! Per-connection session loop
//!
//! A session moves through `Connecting → Active → Closing → Closed`:
//!
//! - **Connecting**: the socket is upgraded; the session registers its client id.
//!   A duplicate id is refused with an error frame and the socket is closed.
//! - **Active**: requests are handled strictly one at a time, in arrival order.
//!   While a job runs the socket is still read, so later requests are queued and
//!   a disconnect cancels the job (which kills the engine subprocess). A
//!   malformed frame takes its place in the queue; everything sent before it is
//!   still answered. Reading pauses while the queue is full.
//! - **Closing**: entered on disconnect, malformed input, or a synthesis failure
//!   that no later request could recover from.
//! - **Closed**: the registry entry is released and the writer task stopped, on
//!   every exit path.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::protocol::{parse_request, ErrorCode, ProtocolError, ServerMessage, SynthesisRequest};
use crate::registry::{ConnectionRegistry, SessionHandle};
use crate::store::{Artifact, ArtifactError, ArtifactStore};
use crate::synthesis::{SynthesisError, Synthesizer};

/// Frames buffered between the session and its socket writer
const OUTBOUND_CAPACITY: usize = 32;

/// Requests read ahead while a job runs; beyond this the socket is left unread
const MAX_QUEUED_REQUESTS: usize = 16;

/// How long the writer gets to flush queued frames after the session ends
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Clone, Debug)]
pub enum CloseReason {
    /// Close frame received or the stream ended
    ClientDisconnected,
    /// The socket failed while reading or writing
    Transport(String),
    /// The client sent something that is not a request
    Protocol(ProtocolError),
    /// Another session already holds this client id
    DuplicateSession,
    /// The runner cannot serve any request (e.g. engine binary missing)
    SynthesisUnavailable(SynthesisError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnected => write!(f, "client disconnected"),
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {e}"),
            CloseReason::DuplicateSession => write!(f, "duplicate session"),
            CloseReason::SynthesisUnavailable(e) => write!(f, "synthesis unavailable: {e}"),
        }
    }
}

/// Everything a session needs from the process
#[derive(Clone)]
pub struct SessionContext {
    pub store: ArtifactStore,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub registry: ConnectionRegistry,
}

enum Inbound {
    Request(SynthesisRequest),
    Invalid(ProtocolError),
    Closed(CloseReason),
}

/// A frame read ahead of the running job, answered in arrival order
type Queued = Result<SynthesisRequest, ProtocolError>;

fn transition(state: &mut SessionState, next: SessionState, client_id: &str) {
    trace!(client_id = %client_id, from = ?*state, to = ?next, "session state");
    *state = next;
}

/// Wait for the next request, answering pings on the way
///
/// Only awaits the stream, so dropping it mid-way loses nothing but a pong.
async fn next_request<S, E>(stream: &mut S, out_tx: &mpsc::Sender<Message>) -> Inbound
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Inbound::Closed(CloseReason::Transport(e.to_string())),
            None => return Inbound::Closed(CloseReason::ClientDisconnected),
        };

        match msg {
            Message::Text(text) => {
                return match parse_request(&text) {
                    Ok(request) => {
                        debug!(text_len = request.text.len(), "received request");
                        Inbound::Request(request)
                    }
                    Err(e) => Inbound::Invalid(e),
                };
            }
            Message::Binary(_) => return Inbound::Invalid(ProtocolError::UnexpectedBinary),
            Message::Ping(data) => {
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Message::Pong(_) => {}
            Message::Close(_) => {
                debug!("received close frame");
                return Inbound::Closed(CloseReason::ClientDisconnected);
            }
        }
    }
}

async fn send_message(out_tx: &mpsc::Sender<Message>, msg: ServerMessage) -> bool {
    out_tx.send(Message::Text(msg.to_json())).await.is_ok()
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Deliver one finished artifact: an `audio` header, then the bytes
///
/// Returns false once the connection can no longer be written to.
async fn deliver(
    ctx: &SessionContext,
    out_tx: &mpsc::Sender<Message>,
    artifact: Artifact,
) -> bool {
    match ctx.store.read(&artifact.path).await {
        Ok(bytes) => {
            let header = ServerMessage::Audio {
                artifact: artifact.file_name(),
                bytes: bytes.len(),
            };
            send_message(out_tx, header).await && out_tx.send(Message::Binary(bytes)).await.is_ok()
        }
        Err(e) => {
            warn!(artifact = %artifact.path.display(), error = %e, "artifact unreadable");
            let code = match e {
                ArtifactError::NotFound(_) => ErrorCode::ArtifactMissing,
                _ => ErrorCode::Internal,
            };
            send_message(out_tx, ServerMessage::error(code, e.to_string())).await
        }
    }
}

/// Drive one connection until it closes
pub async fn run_session<S, E>(socket: S, client_id: String, ctx: SessionContext) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
    <S as Sink<Message>>::Error: fmt::Display + Send,
    E: fmt::Display + Send,
{
    let mut state = SessionState::Connecting;
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let handle = SessionHandle::new(out_tx.clone());
    let session_id = handle.session_id;
    let connected_at = handle.connected_at;

    let registration = match ctx.registry.register(&client_id, handle) {
        Ok(registration) => registration,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "refusing connection");
            let refusal = ServerMessage::error(ErrorCode::DuplicateSession, e.to_string());
            let _ = sink.send(Message::Text(refusal.to_json())).await;
            let _ = sink
                .send(close_frame(close_code::POLICY, "duplicate session"))
                .await;
            transition(&mut state, SessionState::Closing, &client_id);
            let _ = sink.close().await;
            transition(&mut state, SessionState::Closed, &client_id);
            return CloseReason::DuplicateSession;
        }
    };
    transition(&mut state, SessionState::Active, &client_id);
    info!(client_id = %client_id, session_id = %session_id, "session opened");

    // Socket writer: forwards queued frames until told to stop, then flushes
    // what is left. Outlives handles cloned out of the registry.
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = out_rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            debug!(error = %e, "socket write failed");
                            return;
                        }
                    }
                    None => break,
                },
                _ = &mut stop_rx => break,
            }
        }
        while let Ok(msg) = out_rx.try_recv() {
            if sink.send(msg).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    let ready = ServerMessage::Ready {
        session_id: session_id.to_string(),
        client_id: client_id.clone(),
    };
    send_message(&out_tx, ready).await;

    let mut queued: VecDeque<Queued> = VecDeque::new();
    let reason = 'session: loop {
        let request = match queued.pop_front() {
            Some(Ok(request)) => request,
            Some(Err(e)) => break 'session CloseReason::Protocol(e),
            None => match next_request(&mut stream, &out_tx).await {
                Inbound::Request(request) => request,
                Inbound::Invalid(e) => break 'session CloseReason::Protocol(e),
                Inbound::Closed(reason) => break 'session reason,
            },
        };

        let job = ctx.synthesizer.synthesize(request);
        tokio::pin!(job);
        let outcome = loop {
            // Nothing after a malformed frame is ever served
            let read_ahead =
                queued.len() < MAX_QUEUED_REQUESTS && !matches!(queued.back(), Some(Err(_)));
            tokio::select! {
                outcome = &mut job => break outcome,
                inbound = next_request(&mut stream, &out_tx), if read_ahead => match inbound {
                    Inbound::Request(request) => queued.push_back(Ok(request)),
                    Inbound::Invalid(e) => queued.push_back(Err(e)),
                    // Dropping `job` cancels it and kills the engine
                    Inbound::Closed(reason) => break 'session reason,
                },
            }
        };

        match outcome {
            Ok(artifact) => {
                if !deliver(&ctx, &out_tx, artifact).await {
                    break 'session CloseReason::Transport("connection writer closed".to_string());
                }
            }
            Err(e) if e.is_fatal() => {
                warn!(client_id = %client_id, error = %e, "synthesis unavailable");
                // Queued requests would fail the same way
                let unanswered = 1 + queued.iter().filter(|q| q.is_ok()).count();
                for _ in 0..unanswered {
                    send_message(&out_tx, ServerMessage::error(e.code(), e.to_string())).await;
                }
                break 'session CloseReason::SynthesisUnavailable(e);
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "synthesis failed");
                send_message(&out_tx, ServerMessage::error(e.code(), e.to_string())).await;
            }
        }
    };

    transition(&mut state, SessionState::Closing, &client_id);
    match &reason {
        CloseReason::Protocol(e) => {
            warn!(client_id = %client_id, error = %e, "protocol error");
            send_message(
                &out_tx,
                ServerMessage::error(ErrorCode::ProtocolError, e.to_string()),
            )
            .await;
            let _ = out_tx
                .send(close_frame(close_code::PROTOCOL, "protocol error"))
                .await;
        }
        CloseReason::SynthesisUnavailable(_) => {
            let _ = out_tx
                .send(close_frame(close_code::ERROR, "synthesis unavailable"))
                .await;
        }
        _ => {}
    }

    registration.release();
    drop(out_tx);
    let _ = stop_tx.send(());
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    drop(stream);

    transition(&mut state, SessionState::Closed, &client_id);
    let connected_ms = connected_at.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0);
    info!(
        client_id = %client_id,
        session_id = %session_id,
        reason = %reason,
        connected_ms,
        "session closed"
    );
    reason
}
