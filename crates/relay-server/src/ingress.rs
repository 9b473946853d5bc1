//! Per-connection read loop.
//!
//! Joins the connection to its room (history first), turns each inbound
//! frame into a [`ChatMessage`] stamped with a fresh ID and the joined room,
//! and pushes it to the broadcast queue. Any exit path leaves the room and
//! closes the connection exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relay_core::errors::TransportError;
use relay_core::ids::{MessageId, RoomId};
use relay_core::messages::{history_frame, ChatMessage, InboundMessage};
use tracing::{debug, info, warn};

use crate::connection::{Connection, Inbound, Transport};
use crate::persist::PersistHandle;
use crate::queue::BroadcastQueue;
use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct IngressContext {
    pub registry: Arc<RoomRegistry>,
    pub queue: Arc<BroadcastQueue>,
    /// Source of the history frame. `None` joins without one.
    pub history: Option<PersistHandle>,
    pub idle_timeout: Duration,
}

/// Why a read loop ended.
#[derive(Debug)]
pub enum IngressExit {
    /// The transport closed, failed, or went idle.
    Transport(TransportError),
    /// A frame was not a valid message.
    InvalidMessage(String),
    /// The connection was closed elsewhere (eviction or shutdown).
    Cancelled,
    QueueClosed,
    /// The history frame, or a live frame held behind it, could not be queued.
    JoinFailed,
}

impl IngressExit {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.error_kind(),
            Self::InvalidMessage(_) => "invalid_message",
            Self::Cancelled => "cancelled",
            Self::QueueClosed => "queue_closed",
            Self::JoinFailed => "join_failed",
        }
    }

    pub fn is_graceful(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_graceful(),
            Self::Cancelled | Self::QueueClosed => true,
            Self::InvalidMessage(_) | Self::JoinFailed => false,
        }
    }
}

/// Drive one connection from join to cleanup.
pub async fn run<T: Transport>(
    conn: Arc<Connection>,
    room: RoomId,
    mut transport: T,
    ctx: IngressContext,
) -> IngressExit {
    let exit = match join(&conn, &room, &ctx).await {
        Ok(()) => {
            debug!("joined room");
            read_loop(&conn, &room, &mut transport, &ctx).await
        }
        Err(exit) => exit,
    };

    ctx.registry.leave(&room, conn.id());
    conn.close();

    if exit.is_graceful() {
        info!(reason = exit.reason(), "connection closed");
    } else {
        warn!(reason = exit.reason(), detail = ?exit, "connection closed");
    }
    exit
}

/// Join first with live frames held back, then read the history, so every
/// message reaches the client exactly once: in the history or live after it.
async fn join(
    conn: &Arc<Connection>,
    room: &RoomId,
    ctx: &IngressContext,
) -> Result<(), IngressExit> {
    let Some(history) = &ctx.history else {
        ctx.registry.join(room, Arc::clone(conn));
        return Ok(());
    };

    conn.hold_frames();
    ctx.registry.join(room, Arc::clone(conn));

    let replayed = tokio::select! {
        biased;
        _ = conn.cancelled() => return Err(IngressExit::Cancelled),
        replayed = history.replay(room.clone()) => replayed,
    };
    let messages = replayed.unwrap_or_else(|e| {
        warn!(error = %e, "history replay failed, joining without history");
        Vec::new()
    });

    let frame = history_frame(&messages).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize history");
        "[]".to_string()
    });
    let already_sent: HashSet<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
    debug!(messages = messages.len(), "sending history");

    if conn.release_frames(Arc::new(frame), &already_sent) {
        Ok(())
    } else {
        Err(IngressExit::JoinFailed)
    }
}

async fn read_loop<T: Transport>(
    conn: &Connection,
    room: &RoomId,
    transport: &mut T,
    ctx: &IngressContext,
) -> IngressExit {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = conn.cancelled() => break IngressExit::Cancelled,
            read = tokio::time::timeout(ctx.idle_timeout, transport.recv()) => match read {
                Err(_) => break IngressExit::Transport(TransportError::Timeout(ctx.idle_timeout)),
                Ok(Err(e)) => break IngressExit::Transport(e),
                Ok(Ok(inbound)) => inbound,
            },
        };

        let raw = match inbound {
            Inbound::Heartbeat => continue,
            Inbound::Text(raw) => raw,
        };

        let message = match InboundMessage::parse(&raw) {
            Ok(inbound) => ChatMessage::from_inbound(inbound, room),
            Err(e) => break IngressExit::InvalidMessage(e.to_string()),
        };
        debug!(message_id = %message.id, "message received");

        let pushed = tokio::select! {
            biased;
            _ = conn.cancelled() => break IngressExit::Cancelled,
            pushed = ctx.queue.push(message) => pushed,
        };
        if pushed.is_err() {
            break IngressExit::QueueClosed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_store::{Database, MessageStore, SqliteMessageStore, StoreError};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use crate::broadcast::BroadcastEngine;
    use crate::persist;
    use crate::queue::OverflowPolicy;

    struct ChannelTransport {
        rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn recv(&mut self) -> Result<Inbound, TransportError> {
            self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
        }
    }

    struct Harness {
        conn: Arc<Connection>,
        outbound: mpsc::Receiver<Arc<String>>,
        inbound: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
        ctx: IngressContext,
        task: JoinHandle<IngressExit>,
    }

    fn lobby() -> RoomId {
        RoomId::from_raw("lobby")
    }

    fn context(store: Option<Arc<dyn MessageStore>>, idle: Duration) -> IngressContext {
        let history = store.map(|store| {
            let (handle, _worker) = persist::spawn_worker(store, 16, CancellationToken::new());
            handle
        });
        IngressContext {
            registry: Arc::new(RoomRegistry::new()),
            queue: Arc::new(BroadcastQueue::new(16, OverflowPolicy::Block)),
            history,
            idle_timeout: idle,
        }
    }

    fn said(author: &str, text: &str) -> ChatMessage {
        ChatMessage::from_inbound(
            InboundMessage {
                author: author.into(),
                text: text.into(),
            },
            &lobby(),
        )
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Pause {
        Record,
        Replay,
    }

    /// Store that parks one kind of call until the test lets it go. A paused
    /// replay has already taken its snapshot.
    struct GatedStore {
        inner: SqliteMessageStore,
        pause: Pause,
        entered: mpsc::UnboundedSender<()>,
        release: Mutex<mpsc::UnboundedReceiver<()>>,
    }

    impl GatedStore {
        /// Returns the store, the "paused" signal and the release switch.
        fn new(
            pause: Pause,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>, mpsc::UnboundedSender<()>) {
            let (entered, entered_rx) = mpsc::unbounded_channel();
            let (release_tx, release) = mpsc::unbounded_channel();
            let store = Arc::new(Self {
                inner: SqliteMessageStore::new(Database::in_memory().unwrap()),
                pause,
                entered,
                release: Mutex::new(release),
            });
            (store, entered_rx, release_tx)
        }

        fn wait_if(&self, pause: Pause) {
            if self.pause == pause {
                let _ = self.entered.send(());
                let _ = self.release.lock().blocking_recv();
            }
        }
    }

    impl MessageStore for GatedStore {
        fn record(&self, message: &ChatMessage) -> Result<(), StoreError> {
            self.wait_if(Pause::Record);
            self.inner.record(message)
        }

        fn replay(&self, room: &RoomId) -> Result<Vec<ChatMessage>, StoreError> {
            let history = self.inner.replay(room);
            self.wait_if(Pause::Replay);
            history
        }
    }

    fn engine_for(ctx: &IngressContext) -> BroadcastEngine {
        BroadcastEngine::new(
            Arc::clone(&ctx.queue),
            Arc::clone(&ctx.registry),
            ctx.history.clone(),
        )
    }

    async fn wait_for_member(ctx: &IngressContext) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while ctx.registry.member_count(&lobby()) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    fn start(ctx: IngressContext) -> Harness {
        let (tx, outbound) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(tx, CancellationToken::new()));
        let (inbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            Arc::clone(&conn),
            lobby(),
            ChannelTransport { rx },
            ctx.clone(),
        ));
        Harness {
            conn,
            outbound,
            inbound,
            ctx,
            task,
        }
    }

    fn text(raw: &str) -> Result<Inbound, TransportError> {
        Ok(Inbound::Text(raw.to_string()))
    }

    #[tokio::test]
    async fn message_is_stamped_and_queued() {
        let h = start(context(None, Duration::from_secs(30)));
        h.inbound
            .send(text(r#"{"author":"alice","text":"hi","room":"elsewhere","id":"forged"}"#))
            .unwrap();

        let queued = h.ctx.queue.pop().await.unwrap();
        assert_eq!(queued.author, "alice");
        assert_eq!(queued.text, "hi");
        assert_eq!(queued.room, lobby());
        assert!(queued.id.as_str().starts_with("msg_"));
        assert_eq!(h.ctx.registry.member_count(&lobby()), 1);

        drop(h.inbound);
        let exit = h.task.await.unwrap();
        assert!(matches!(exit, IngressExit::Transport(TransportError::Closed)));
        assert!(!h.ctx.registry.contains_room(&lobby()));
        assert!(h.conn.is_closed());
    }

    #[tokio::test]
    async fn history_is_first_frame() {
        let store = Arc::new(SqliteMessageStore::new(Database::in_memory().unwrap()));
        for text in ["one", "two"] {
            store.record(&said("bob", text)).unwrap();
        }
        let mut h = start(context(Some(store), Duration::from_secs(30)));

        let frame = h.outbound.recv().await.unwrap();
        let history: Vec<ChatMessage> = serde_json::from_str(&frame).unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);

        drop(h.inbound);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn empty_history_sends_empty_array() {
        let store = Arc::new(SqliteMessageStore::new(Database::in_memory().unwrap()));
        let mut h = start(context(Some(store), Duration::from_secs(30)));
        assert_eq!(h.outbound.recv().await.unwrap().as_str(), "[]");
        drop(h.inbound);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_json_ends_connection() {
        let h = start(context(None, Duration::from_secs(30)));
        h.inbound.send(text("not json")).unwrap();

        let exit = h.task.await.unwrap();
        assert!(matches!(exit, IngressExit::InvalidMessage(_)));
        assert!(!exit.is_graceful());
        assert!(h.ctx.queue.is_empty());
        assert_eq!(h.ctx.registry.room_count(), 0);
        assert!(h.conn.is_closed());
    }

    #[tokio::test]
    async fn heartbeats_are_not_messages() {
        let h = start(context(None, Duration::from_secs(30)));
        h.inbound.send(Ok(Inbound::Heartbeat)).unwrap();
        h.inbound.send(text(r#"{"text":"after ping"}"#)).unwrap();

        let queued = h.ctx.queue.pop().await.unwrap();
        assert_eq!(queued.text, "after ping");
        assert_eq!(queued.author, "");
        drop(h.inbound);
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let h = start(context(None, Duration::from_secs(90)));
        let exit = h.task.await.unwrap();
        assert!(matches!(exit, IngressExit::Transport(TransportError::Timeout(_))));
        assert_eq!(exit.reason(), "timeout");
        assert_eq!(h.ctx.registry.room_count(), 0);
        drop(h.inbound);
    }

    #[tokio::test]
    async fn external_close_cancels_read_loop() {
        let h = start(context(None, Duration::from_secs(30)));
        h.inbound.send(Ok(Inbound::Heartbeat)).unwrap();
        tokio::task::yield_now().await;

        h.conn.close();
        let exit = h.task.await.unwrap();
        assert!(matches!(exit, IngressExit::Cancelled));
        assert_eq!(h.ctx.registry.room_count(), 0);
        assert!(h.ctx.registry.is_consistent());
    }

    #[tokio::test]
    async fn closed_queue_ends_connection() {
        let ctx = context(None, Duration::from_secs(30));
        ctx.queue.close();
        let h = start(ctx);
        h.inbound.send(text(r#"{"text":"too late"}"#)).unwrap();

        let exit = h.task.await.unwrap();
        assert!(matches!(exit, IngressExit::QueueClosed));
        assert_eq!(h.ctx.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn transport_error_is_not_graceful() {
        let h = start(context(None, Duration::from_secs(30)));
        h.inbound
            .send(Err(TransportError::Io("connection reset".into())))
            .unwrap();

        let exit = h.task.await.unwrap();
        assert_eq!(exit.reason(), "io");
        assert!(!exit.is_graceful());
    }

    #[tokio::test]
    async fn message_broadcast_during_replay_follows_history() {
        let (store, mut entered, release) = GatedStore::new(Pause::Replay);
        let ctx = context(Some(store.clone()), Duration::from_secs(30));
        let mut bob = start(ctx.clone());

        entered.recv().await.unwrap();
        assert_eq!(ctx.registry.member_count(&lobby()), 1);
        let sent = said("alice", "while bob joins");
        engine_for(&ctx).dispatch(sent.clone());
        release.send(()).unwrap();

        assert_eq!(bob.outbound.recv().await.unwrap().as_str(), "[]");
        let live: ChatMessage = serde_json::from_str(&bob.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(live, sent);
        assert!(bob.outbound.try_recv().is_err());

        drop(bob.inbound);
        bob.task.await.unwrap();
    }

    #[tokio::test]
    async fn message_still_being_recorded_is_in_history() {
        let (store, mut entered, release) = GatedStore::new(Pause::Record);
        let ctx = context(Some(store.clone()), Duration::from_secs(30));
        let sent = said("alice", "before bob");
        engine_for(&ctx).dispatch(sent.clone());
        entered.recv().await.unwrap();

        let mut bob = start(ctx.clone());
        wait_for_member(&ctx).await;
        release.send(()).unwrap();

        let history: Vec<ChatMessage> =
            serde_json::from_str(&bob.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(history, vec![sent]);
        assert!(bob.outbound.try_recv().is_err());
        assert_eq!(store.inner.count(&lobby()).unwrap(), 1);

        drop(bob.inbound);
        bob.task.await.unwrap();
    }

    #[tokio::test]
    async fn eviction_while_waiting_for_history_ends_join() {
        let (store, mut entered, release) = GatedStore::new(Pause::Replay);
        let ctx = context(Some(store), Duration::from_secs(30));
        let bob = start(ctx.clone());
        entered.recv().await.unwrap();

        // The outbound queue holds 16 frames; 15 may wait behind the history.
        let engine = engine_for(&ctx);
        for i in 0..16 {
            engine.dispatch(said("alice", &format!("flood {i}")));
        }
        assert!(bob.conn.is_closed());
        release.send(()).unwrap();

        let exit = bob.task.await.unwrap();
        assert!(matches!(exit, IngressExit::Cancelled));
        assert_eq!(ctx.registry.room_count(), 0);
    }
}
