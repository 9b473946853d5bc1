//! Background recorder for dispatched messages.
//!
//! The dispatcher hands each message over with a non-blocking `submit`; a
//! single worker writes them to the store in submission order, so history
//! replays in the order messages were broadcast. History reads go through
//! the same worker, so a replay sees every message submitted before it.

use std::sync::Arc;

use relay_core::ids::RoomId;
use relay_core::messages::ChatMessage;
use relay_store::{MessageStore, StoreError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("history worker unavailable")]
    Unavailable,
}

enum Request {
    Record(ChatMessage),
    Replay {
        room: RoomId,
        reply: oneshot::Sender<Result<Vec<ChatMessage>, StoreError>>,
    },
}

#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<Request>,
}

impl PersistHandle {
    /// Queue a message for recording. Returns `false` if it was dropped.
    pub fn submit(&self, message: ChatMessage) -> bool {
        match self.tx.try_send(Request::Record(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                if let Request::Record(message) = request {
                    warn!(room = %message.room, message_id = %message.id, "persist queue full, message not recorded");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                if let Request::Record(message) = request {
                    warn!(room = %message.room, message_id = %message.id, "persist worker stopped, message not recorded");
                }
                false
            }
        }
    }

    /// History of `room`, read after every message submitted so far has been
    /// written. Waits for queue space instead of failing.
    pub async fn replay(&self, room: RoomId) -> Result<Vec<ChatMessage>, ReplayError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request::Replay { room, reply })
            .await
            .map_err(|_| ReplayError::Unavailable)?;
        response
            .await
            .map_err(|_| ReplayError::Unavailable)?
            .map_err(ReplayError::from)
    }
}

/// Start the recorder. The worker exits once every handle has been dropped,
/// or once `stop` is cancelled and the backlog is written.
pub fn spawn_worker(
    store: Arc<dyn MessageStore>,
    capacity: usize,
    stop: CancellationToken,
) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Request>(capacity.max(1));

    let worker = tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                biased;
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = stop.cancelled() => {
                    rx.close();
                    while let Some(request) = rx.recv().await {
                        serve(&store, request).await;
                    }
                    break;
                }
            };
            serve(&store, request).await;
        }
        debug!("persist worker stopped");
    });

    (PersistHandle { tx }, worker)
}

async fn serve(store: &Arc<dyn MessageStore>, request: Request) {
    let store = Arc::clone(store);
    match request {
        Request::Record(message) => {
            let room = message.room.clone();
            let message_id = message.id.clone();
            match tokio::task::spawn_blocking(move || store.record(&message)).await {
                Ok(Ok(())) => debug!(room = %room, message_id = %message_id, "message recorded"),
                Ok(Err(e)) => {
                    warn!(room = %room, message_id = %message_id, error = %e, "failed to record message");
                }
                Err(e) => error!(room = %room, error = %e, "record task panicked"),
            }
        }
        Request::Replay { room, reply } => {
            let target = room.clone();
            match tokio::task::spawn_blocking(move || store.replay(&target)).await {
                // The joiner may have gone away; nothing to do then.
                Ok(result) => {
                    let _ = reply.send(result);
                }
                Err(e) => error!(room = %room, error = %e, "replay task panicked"),
            }
        }
    }
}
