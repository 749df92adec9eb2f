//! Server → Client events
//!
//! Every push transport (WebSocket frame, SSE `data:` line) carries one
//! [`ServerEvent`] serialized as `{"type": "...", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::*;

/// Events pushed from server to widget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(Message),
    Typing(TypingData),
    Presence(PresenceData),
    Read(ReadData),
    MessageEdited(MessageEditedData),
    MessageDeleted(MessageDeletedData),
    Event(CustomEvent),
    VersionWarning(VersionWarning),
    ConfigUpdate(ConfigUpdate),
}

impl ServerEvent {
    /// Wire name of the event (`type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => "message",
            ServerEvent::Typing(_) => "typing",
            ServerEvent::Presence(_) => "presence",
            ServerEvent::Read(_) => "read",
            ServerEvent::MessageEdited(_) => "message_edited",
            ServerEvent::MessageDeleted(_) => "message_deleted",
            ServerEvent::Event(_) => "event",
            ServerEvent::VersionWarning(_) => "version_warning",
            ServerEvent::ConfigUpdate(_) => "config_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub session_id: String,
    pub sender: Sender,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadData {
    pub session_id: String,
    pub message_ids: Vec<String>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEditedData {
    pub message_id: String,
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedData {
    pub message_id: String,
    pub deleted_at: DateTime<Utc>,
}

/// Runtime widget settings pushed by the server (welcome message, colors, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::ServerEvent;
    use crate::server::*;

    #[test]
    fn envelope_is_type_plus_data() {
        let msg = ServerEvent::Presence(PresenceData { online: true });
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["type"], "presence");
        assert_eq!(value["data"]["online"], true);
        assert_eq!(msg.kind(), "presence");
    }

    #[test]
    fn roundtrip_message_deleted() {
        let msg = ServerEvent::MessageDeleted(MessageDeletedData {
            message_id: "m-9".to_string(),
            deleted_at: Utc::now(),
        });

        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains(r#""type":"message_deleted""#));
        assert!(json.contains(r#""messageId":"m-9""#));
        let reparsed: ServerEvent = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            ServerEvent::MessageDeleted(data) => assert_eq!(data.message_id, "m-9"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn deserializes_widget_facing_message_event() {
        let json = r#"{
          "type":"message",
          "data":{
            "id":"m-1",
            "sessionId":"s-1",
            "content":"Hi there",
            "sender":"operator",
            "timestamp":"2026-01-02T03:04:05Z"
          }
        }"#;
        let parsed: ServerEvent = serde_json::from_str(json).expect("deserialize");
        match parsed {
            ServerEvent::Message(message) => {
                assert_eq!(message.sender, Sender::Operator);
                assert_eq!(message.status, MessageStatus::Sent);
                assert!(message.reply_to.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn config_update_flattens_values() {
        let mut update = ConfigUpdate::default();
        update
            .values
            .insert("welcomeMessage".into(), serde_json::Value::from("Hello!"));
        let value = serde_json::to_value(ServerEvent::ConfigUpdate(update)).expect("serialize");
        assert_eq!(value["data"]["welcomeMessage"], "Hello!");
    }
}
