//! Bounded inbound queue feeding the dispatcher.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use relay_core::errors::QueueError;
use relay_core::messages::ChatMessage;
use tokio::sync::Notify;
use tracing::warn;

/// What `push` does when the queue is at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for the dispatcher to make room. Nothing is lost.
    #[default]
    Block,
    /// Discard the message being pushed.
    DropNewest,
    /// Discard the oldest queued message to make room.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Block => "block",
            Self::DropNewest => "drop-newest",
            Self::DropOldest => "drop-oldest",
        })
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "drop-newest" => Ok(Self::DropNewest),
            "drop-oldest" => Ok(Self::DropOldest),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

/// Result of a successful `push`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Queue was full; the pushed message was discarded.
    DroppedNewest,
    /// Queue was full; the oldest message was discarded and this one queued.
    DroppedOldest,
}

struct QueueState {
    items: VecDeque<ChatMessage>,
    closed: bool,
}

pub struct BroadcastQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    readable: Notify,
    writable: Notify,
}

impl BroadcastQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            capacity,
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub async fn push(&self, message: ChatMessage) -> Result<Enqueued, QueueError> {
        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(message);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(Enqueued::Accepted);
                }
                match self.policy {
                    OverflowPolicy::DropNewest => {
                        drop(state);
                        warn!(room = %message.room, message_id = %message.id, "broadcast queue full, dropped newest");
                        return Ok(Enqueued::DroppedNewest);
                    }
                    OverflowPolicy::DropOldest => {
                        let dropped = state.items.pop_front();
                        state.items.push_back(message);
                        drop(state);
                        self.readable.notify_one();
                        if let Some(dropped) = dropped {
                            warn!(room = %dropped.room, message_id = %dropped.id, "broadcast queue full, dropped oldest");
                        }
                        return Ok(Enqueued::DroppedOldest);
                    }
                    OverflowPolicy::Block => {}
                }
            }

            writable.await;
        }
    }

    /// Next message in submission order. `None` once closed and drained.
    pub async fn pop(&self) -> Option<ChatMessage> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(message) = state.items.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }

            readable.await;
        }
    }

    /// Reject further pushes and wake everyone. Queued messages stay poppable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
