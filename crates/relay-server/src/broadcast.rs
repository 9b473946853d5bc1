//! The dispatcher: sole consumer of the broadcast queue.
//!
//! Draining through one task gives a total order per room, and the registry's
//! `fan_out` makes lookup, delivery and dead-member cleanup one critical
//! section per message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_core::messages::ChatMessage;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::persist::PersistHandle;
use crate::queue::BroadcastQueue;
use crate::registry::RoomRegistry;

#[derive(Default)]
pub struct EngineStats {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    persist_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub delivered: u64,
    pub evicted: u64,
    pub persist_dropped: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            persist_dropped: self.persist_dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct BroadcastEngine {
    queue: Arc<BroadcastQueue>,
    registry: Arc<RoomRegistry>,
    persist: Option<PersistHandle>,
    stats: Arc<EngineStats>,
}

impl BroadcastEngine {
    pub fn new(
        queue: Arc<BroadcastQueue>,
        registry: Arc<RoomRegistry>,
        persist: Option<PersistHandle>,
    ) -> Self {
        Self {
            queue,
            registry,
            persist,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drain the queue until it is closed and empty.
    pub async fn run(self) {
        info!("dispatcher started");
        while let Some(message) = self.queue.pop().await {
            self.dispatch(message);
        }
        info!(
            dispatched = self.stats.dispatched.load(Ordering::Relaxed),
            "dispatcher stopped"
        );
    }

    /// Fan one message out to its room, evict members whose send failed,
    /// then hand the message to persistence.
    ///
    /// The hand-off happens before the registry lock is released. A client
    /// that joins afterwards either holds this message's frame or finds the
    /// message ahead of its history read in the persistence queue.
    pub fn dispatch(&self, message: ChatMessage) {
        let frame = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(room = %message.room, message_id = %message.id, error = %e, "failed to serialize message");
                return;
            }
        };

        let room = message.room.clone();
        let message_id = message.id.clone();
        let mut recorded = true;
        let report = self.registry.fan_out_then(
            &room,
            |conn| conn.deliver(&message_id, Arc::clone(&frame)),
            || {
                if let Some(persist) = &self.persist {
                    recorded = persist.submit(message);
                }
            },
        );

        for conn in &report.evicted {
            conn.close();
            warn!(room = %room, conn_id = %conn.id(), "member send failed, evicted");
        }

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .evicted
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        if !recorded {
            self.stats.persist_dropped.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            room = %room,
            message_id = %message_id,
            attempted = report.attempted,
            delivered = report.delivered,
            "broadcast"
        );
    }
}
