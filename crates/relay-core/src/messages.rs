use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, RoomId};

/// A relayed chat message as it appears on the wire and in history.
///
/// `id` and `room` are always server-assigned; see [`ChatMessage::from_inbound`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub author: String,
    pub text: String,
    pub room: RoomId,
}

/// Client-submitted payload. Any `id` or `room` the client sends is ignored.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub text: String,
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl ChatMessage {
    /// Stamp an inbound payload with a fresh ID and the sender's joined room.
    pub fn from_inbound(inbound: InboundMessage, room: &RoomId) -> Self {
        Self {
            id: MessageId::new(),
            author: inbound.author,
            text: inbound.text,
            room: room.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Serialize replayed history as the single JSON array frame sent on join.
pub fn history_frame(messages: &[ChatMessage]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_ignores_client_id_and_room() {
        let inbound =
            InboundMessage::parse(r#"{"id":"forged","author":"alice","text":"hi","room":"other"}"#)
                .unwrap();
        let msg = ChatMessage::from_inbound(inbound, &RoomId::from_raw("lobby"));
        assert_ne!(msg.id.as_str(), "forged");
        assert!(msg.id.as_str().starts_with("msg_"));
        assert_eq!(msg.room.as_str(), "lobby");
        assert_eq!(msg.author, "alice");
        assert_eq!(msg.text, "hi");
    }

    #[test]
    fn inbound_missing_fields_default_empty() {
        let inbound = InboundMessage::parse("{}").unwrap();
        assert!(inbound.author.is_empty());
        assert!(inbound.text.is_empty());
    }

    #[test]
    fn inbound_rejects_non_json() {
        assert!(InboundMessage::parse("hello there").is_err());
    }

    #[test]
    fn wire_shape_has_four_string_fields() {
        let msg = ChatMessage {
            id: MessageId::from_raw("msg_1"),
            author: "alice".into(),
            text: "hi".into(),
            room: RoomId::from_raw("lobby"),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["id"], "msg_1");
        assert_eq!(value["author"], "alice");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["room"], "lobby");
    }

    #[test]
    fn empty_history_is_empty_array() {
        assert_eq!(history_frame(&[]).unwrap(), "[]");
    }
}
