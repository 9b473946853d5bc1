use chrono::Utc;
use tracing::instrument;

use relay_core::ids::{MessageId, RoomId};
use relay_core::messages::ChatMessage;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable message history, consulted by the relay at two points only:
/// after a message has been fanned out, and once when a connection joins.
pub trait MessageStore: Send + Sync {
    /// Append a dispatched message to the room's history.
    fn record(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// All recorded messages for `room`, oldest first.
    fn replay(&self, room: &RoomId) -> Result<Vec<ChatMessage>, StoreError>;
}

pub struct SqliteMessageStore {
    db: Database,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of recorded messages for a room.
    #[instrument(skip(self), fields(room = %room))]
    pub fn count(&self, room: &RoomId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE room = ?1",
                [room.as_str()],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }
}

impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self, message), fields(room = %message.room, message_id = %message.id))]
    fn record(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, author, text, room, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    message.id.as_str(),
                    message.author,
                    message.text,
                    message.room.as_str(),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(room = %room))]
    fn replay(&self, room: &RoomId) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, author, text, room FROM messages WHERE room = ?1 ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query([room.as_str()])?;
            let mut history = Vec::new();
            while let Some(row) = rows.next()? {
                history.push(message_from_row(row)?);
            }
            Ok(history)
        })
    }
}

fn message_from_row(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    let id: String = row_helpers::get(row, 0, "messages", "id")?;
    let room: String = row_helpers::get(row, 3, "messages", "room")?;
    Ok(ChatMessage {
        id: MessageId::from_raw(row_helpers::non_empty(id, "messages", "id")?),
        author: row_helpers::get(row, 1, "messages", "author")?,
        text: row_helpers::get(row, 2, "messages", "text")?,
        room: RoomId::from_raw(row_helpers::non_empty(room, "messages", "room")?),
    })
}
