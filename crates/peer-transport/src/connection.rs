//! Individual peer connections.
//!
//! Each connection wraps a WebSocket stream that has already completed the
//! handshake. The stream is split: a write task drains an unbounded queue of
//! outgoing messages, and a read task dispatches incoming requests and
//! completes pending outbound requests.

use crate::handler::Handlers;
use crate::message::{Frame, Handshake, MAX_FRAME_SIZE, Outcome};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use peer_core::PeerIdentifier;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{Instrument, Span, debug, error, trace, warn};

pub type ConnectionId = u64;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by a connection maintainer
    Outbound,
}

/// Why an outbound request on one connection did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    Send(String),

    #[error("Timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

/// One live, handshaken WebSocket connection.
pub struct Connection {
    id: ConnectionId,
    peer: PeerIdentifier,
    direction: Direction,
    outgoing: mpsc::UnboundedSender<Message>,
    /// Outbound requests awaiting a response. `None` once the connection
    /// has closed; no request may be registered after that.
    pending: Mutex<Option<HashMap<u64, oneshot::Sender<Outcome>>>>,
    next_request: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Start the read and write tasks for `ws`.
    ///
    /// `on_closed` runs once the read side ends on its own (remote close or
    /// I/O error). It does not run when the connection is closed locally.
    pub(crate) fn spawn<S, F>(
        id: ConnectionId,
        peer: PeerIdentifier,
        direction: Direction,
        ws: WebSocketStream<S>,
        handlers: Arc<Handlers>,
        span: Span,
        on_closed: F,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(&Connection) + Send + 'static,
    {
        let (write, read) = ws.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id,
            peer,
            direction,
            outgoing,
            pending: Mutex::new(Some(HashMap::new())),
            next_request: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(write, outgoing_rx).instrument(span.clone()));
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(
                async move {
                    conn.read_loop(read, handlers).await;
                    conn.fail_pending();
                    on_closed(&conn);
                }
                .instrument(span),
            )
        };
        conn.lock_tasks().extend([reader, writer]);
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentifier {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.lock_pending().is_none()
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn request(
        &self,
        procedure: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Result<Value, String>, RequestError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request {
            id,
            procedure: procedure.to_string(),
            body,
        };
        let data = frame
            .to_binary()
            .map_err(|e| RequestError::Send(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        match self.lock_pending().as_mut() {
            Some(pending) => pending.insert(id, tx),
            None => return Err(RequestError::Closed),
        };
        let _guard = PendingGuard { conn: self, id };

        self.outgoing
            .send(Message::Binary(data.into()))
            .map_err(|_| RequestError::Send("write side has shut down".into()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome.into()),
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => Err(RequestError::Timeout),
        }
    }

    /// Send a close frame, fail pending requests, and stop both tasks.
    pub async fn close(&self) {
        self.fail_pending();
        let _ = self.outgoing.send(Message::Close(None));

        let tasks = std::mem::take(&mut *self.lock_tasks());
        let mut tasks = tasks.into_iter();
        if let Some(reader) = tasks.next() {
            reader.abort();
            let _ = reader.await;
        }
        for writer in tasks {
            // Give the close frame a moment to flush.
            let abort = writer.abort_handle();
            if tokio::time::timeout(Duration::from_millis(100), writer)
                .await
                .is_err()
            {
                abort.abort();
            }
        }
        debug!("Closed {:?} connection {} to {}", self.direction, self.id, self.peer);
    }

    async fn read_loop<S>(&self, mut read: SplitStream<WebSocketStream<S>>, handlers: Arc<Handlers>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Dropped (and aborted) with the read loop.
        let mut serving = JoinSet::new();

        loop {
            let data = match read.next().await {
                Some(Ok(msg)) => match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", self.peer);
                        break;
                    }
                    Message::Frame(_) => continue,
                },
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} to {} closed", self.id, self.peer);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", self.peer, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} to {} stream ended", self.id, self.peer);
                    break;
                }
            };

            while serving.try_join_next().is_some() {}

            if data.len() > MAX_FRAME_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    self.peer,
                    data.len(),
                    MAX_FRAME_SIZE
                );
                continue;
            }

            match Frame::from_binary(&data) {
                Ok(Frame::Request {
                    id,
                    procedure,
                    body,
                }) => {
                    trace!("Request {} for {} from {}", id, procedure, self.peer);
                    let handlers = Arc::clone(&handlers);
                    let outgoing = self.outgoing.clone();
                    serving.spawn(
                        async move {
                            let outcome = handlers.dispatch(&procedure, body).await.into();
                            let response = Frame::Response { id, outcome };
                            match response.to_binary() {
                                Ok(data) => {
                                    let _ = outgoing.send(Message::Binary(data.into()));
                                }
                                Err(e) => error!("Failed to encode response {}: {}", id, e),
                            }
                        }
                        .in_current_span(),
                    );
                }
                Ok(Frame::Response { id, outcome }) => {
                    let waiter = self
                        .lock_pending()
                        .as_mut()
                        .and_then(|pending| pending.remove(&id));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(outcome);
                        }
                        None => debug!("Response {} from {} has no waiter", id, self.peer),
                    }
                }
                Ok(Frame::Handshake(_)) => {
                    debug!("Ignoring repeated handshake from {}", self.peer);
                }
                Err(e) => {
                    warn!("Dropping malformed frame from {}: {}", self.peer, e);
                }
            }
        }
    }

    /// Mark the connection closed; waiters see their channel drop.
    fn fail_pending(&self) {
        if let Some(pending) = self.lock_pending().take() {
            if !pending.is_empty() {
                debug!(
                    "Failing {} pending request(s) on connection to {}",
                    pending.len(),
                    self.peer
                );
            }
        }
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<HashMap<u64, oneshot::Sender<Outcome>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Removes a request's waiter when the caller stops waiting for it.
struct PendingGuard<'a> {
    conn: &'a Connection,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.conn.lock_pending().as_mut() {
            pending.remove(&self.id);
        }
    }
}

async fn write_loop<S>(
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(msg) = outgoing.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            debug!("Write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
}

/// Exchange handshakes on a freshly opened stream.
///
/// The dialing side speaks first; the accepting side answers after reading
/// the dialer's handshake. Returns the remote side's handshake.
pub(crate) async fn exchange_handshake<S>(
    ws: &mut WebSocketStream<S>,
    ours: &Handshake,
    direction: Direction,
) -> Result<Handshake, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let data = Frame::Handshake(ours.clone())
        .to_binary()
        .map_err(|e| e.to_string())?;

    if direction == Direction::Outbound {
        ws.send(Message::Binary(data.clone().into()))
            .await
            .map_err(|e| format!("failed to send handshake: {e}"))?;
    }

    let theirs = read_handshake(ws).await?;
    if theirs.service != ours.service {
        // Closing lets the other side fail now instead of at its dial timeout.
        let _ = ws.close(None).await;
        return Err(format!(
            "service mismatch: expected {:?}, got {:?}",
            ours.service, theirs.service
        ));
    }

    if direction == Direction::Inbound {
        ws.send(Message::Binary(data.into()))
            .await
            .map_err(|e| format!("failed to send handshake: {e}"))?;
    }
    Ok(theirs)
}

async fn read_handshake<S>(ws: &mut WebSocketStream<S>) -> Result<Handshake, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err("connection closed before handshake".into());
            }
            Some(Err(e)) => return Err(e.to_string()),
        };

        return match Frame::from_binary(&data) {
            Ok(Frame::Handshake(handshake)) => Ok(handshake),
            Ok(other) => Err(format!("expected handshake, got {}", other.kind())),
            Err(e) => Err(format!("malformed handshake: {e}")),
        };
    }
}
