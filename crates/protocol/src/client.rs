//! Client → Server messages
//!
//! Request and response bodies for the widget HTTP API, the operator
//! (bridge webhook) API and the WebSocket uplink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::*;

/// Messages a widget may send over an open WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Typing {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    Event(CustomEvent),
    Ping,
}

// -- Widget API --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub visitor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<UserIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
    pub visitor_id: String,
    pub operator_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub session_id: String,
    pub content: String,
    #[serde(default = "default_sender")]
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

fn default_sender() -> Sender {
    Sender::Visitor
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesQuery {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesResponse {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub session_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageResponse {
    pub id: String,
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageQuery {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageResponse {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub session_id: String,
    pub message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub session_id: String,
    #[serde(default = "default_sender")]
    pub sender: Sender,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    pub session_id: String,
    #[serde(default)]
    pub identity: Option<UserIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub online: bool,
    pub ai_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEventRequest {
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

// -- Operator API (bridge webhooks) --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorMessageRequest {
    pub session_id: String,
    pub content: String,
    pub source_bridge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_name: Option<String>,
    /// Platform handle of the operator's message, recorded for later edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_message_id: Option<String>,
    /// Platform handle of the message the operator replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_native_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorEditRequest {
    pub session_id: String,
    pub source_bridge: String,
    pub native_message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorDeleteRequest {
    pub session_id: String,
    pub source_bridge: String,
    pub native_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorStatusRequest {
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_request_defaults_to_visitor_sender() {
        let json = r#"{"sessionId":"s-1","content":"Hello"}"#;
        let req: SendMessageRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(req.sender, Sender::Visitor);
        assert!(req.reply_to.is_none());
    }

    #[test]
    fn deserializes_ws_typing_uplink() {
        let json = r#"{"type":"typing","data":{"isTyping":true}}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("deserialize");
        assert_eq!(msg, ClientMessage::Typing { is_typing: true });
    }

    #[test]
    fn deserializes_ws_ping_without_data() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).expect("deserialize");
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn operator_request_accepts_optional_native_ids() {
        let json = r#"{
          "sessionId":"s-1",
          "content":"Hi there",
          "sourceBridge":"slack",
          "nativeMessageId":"1700000000.000100"
        }"#;
        let req: OperatorMessageRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(req.source_bridge, "slack");
        assert_eq!(req.native_message_id.as_deref(), Some("1700000000.000100"));
        assert!(req.reply_to_native_id.is_none());
    }
}
