//! Connection handle shared between the registry and the ingress task, plus
//! the receive-side transport seam.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use relay_core::errors::TransportError;
use parking_lot::Mutex;
use relay_core::ids::{ConnectionId, MessageId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Write side of a connected client.
///
/// `deliver` never blocks: it pushes a serialized frame into the connection's
/// bounded outbound queue, which a writer task pumps to the socket. A full
/// or closed queue is reported as a failed delivery.
///
/// While a joining client waits for its history, frames are held back
/// instead (see [`Connection::hold_frames`]).
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    held: Mutex<Option<Vec<(MessageId, Arc<String>)>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<Arc<String>>, cancel: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            held: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue the frame for message `id`. Returns `false` if the connection is
    /// closed or has no room left for it.
    pub fn deliver(&self, id: &MessageId, frame: Arc<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut held = self.held.lock();
        match held.as_mut() {
            // One outbound slot stays free for the history frame.
            Some(frames) if frames.len() < self.tx.max_capacity().saturating_sub(1) => {
                frames.push((id.clone(), frame));
                true
            }
            Some(_) => false,
            None => self.tx.try_send(frame).is_ok(),
        }
    }

    /// Start holding delivered frames back until [`Connection::release_frames`].
    pub fn hold_frames(&self) {
        self.held.lock().get_or_insert_with(Vec::new);
    }

    /// Queue `prelude`, then every held frame whose message is not in
    /// `already_sent`, and go back to delivering directly.
    ///
    /// Runs under the same lock as `deliver`, so nothing can overtake the
    /// held frames. Returns `false` if any of them could not be queued.
    pub fn release_frames(&self, prelude: Arc<String>, already_sent: &HashSet<MessageId>) -> bool {
        let mut held = self.held.lock();
        let frames = held.take().unwrap_or_default();
        if self.is_closed() || self.tx.try_send(prelude).is_err() {
            return false;
        }
        frames
            .into_iter()
            .filter(|(id, _)| !already_sent.contains(id))
            .all(|(_, frame)| self.tx.try_send(frame).is_ok())
    }

    /// Close the connection. Only the first call has an effect; it returns
    /// `true` for that call and `false` afterwards.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the connection closes, a write fails, or the
    /// server shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("holding", &self.held.lock().is_some())
            .finish()
    }
}

/// One unit read from a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Control traffic (ping/pong). Counts as activity, carries no message.
    Heartbeat,
}

/// Receive side of a transport. A returned error is terminal.
#[async_trait]
pub trait Transport: Send {
    async fn recv(&mut self) -> Result<Inbound, TransportError>;
}

/// Adapts the read half of a WebSocket.
pub struct WsTransport<S> {
    stream: S,
}

impl<S> WsTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S, E> Transport for WsTransport<S>
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
    E: std::fmt::Display + Send,
{
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        match self.stream.next().await {
            None | Some(Ok(WsMessage::Close(_))) => Err(TransportError::Closed),
            Some(Err(e)) => Err(TransportError::Io(e.to_string())),
            Some(Ok(WsMessage::Text(text))) => Ok(Inbound::Text(text.to_string())),
            Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8(bytes.to_vec())
                .map(Inbound::Text)
                .map_err(|_| TransportError::Protocol("binary frame is not UTF-8".into())),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => Ok(Inbound::Heartbeat),
        }
    }
}

/// Pump queued frames to the socket and ping every `heartbeat`.
///
/// The task ends when the token is cancelled, the queue is dropped, or a
/// socket write fails. On exit it cancels the token so the ingress side runs
/// its cleanup, then closes the socket.
pub fn spawn_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<String>>,
    cancel: CancellationToken,
    heartbeat: Duration,
) -> JoinHandle<()>
where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    let task = async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(WsMessage::Text(String::clone(&frame).into())).await {
                        tracing::debug!(error = %e, "socket write failed");
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!("sent ping");
                }
            }
        }

        cancel.cancel();
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    };
    tokio::spawn(task.in_current_span())
}
