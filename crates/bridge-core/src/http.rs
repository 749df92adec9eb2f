//! Bridge that forwards events to a remote bridge server over HTTP.
//!
//! Each notification becomes one `POST <base_url>/api/events` with a typed
//! JSON body. The remote side owns the platform wire format; it answers
//! `{"nativeMessageId": "..."}` when it posted something we may later edit.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pocketping_protocol::{CustomEvent, Message, MessageStatus, Session};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Bridge, BridgeError, BridgeResult, NativeMessageId, ReplyContext};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpBridgeConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl HttpBridgeConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Outgoing event bodies understood by the remote bridge server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum BridgeEvent<'a> {
    NewSession {
        session: &'a Session,
    },
    VisitorMessage {
        message: &'a Message,
        session: &'a Session,
        #[serde(rename = "replyToNativeId", skip_serializing_if = "Option::is_none")]
        reply_to_native_id: Option<&'a str>,
        #[serde(rename = "replyQuote", skip_serializing_if = "Option::is_none")]
        reply_quote: Option<&'a str>,
    },
    OperatorMessage {
        message: &'a Message,
        session: &'a Session,
        #[serde(rename = "sourceBridge")]
        source_bridge: &'a str,
        #[serde(rename = "operatorName", skip_serializing_if = "Option::is_none")]
        operator_name: Option<&'a str>,
    },
    Typing {
        #[serde(rename = "sessionId")]
        session_id: &'a str,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    MessageRead {
        #[serde(rename = "sessionId")]
        session_id: &'a str,
        #[serde(rename = "messageIds")]
        message_ids: &'a [String],
        status: MessageStatus,
    },
    CustomEvent {
        event: &'a CustomEvent,
        session: &'a Session,
    },
    IdentityUpdate {
        session: &'a Session,
    },
    VisitorMessageEdited {
        #[serde(rename = "sessionId")]
        session_id: &'a str,
        #[serde(rename = "messageId")]
        message_id: &'a str,
        #[serde(rename = "nativeMessageId")]
        native_message_id: &'a str,
        content: &'a str,
        #[serde(rename = "editedAt")]
        edited_at: DateTime<Utc>,
    },
    VisitorMessageDeleted {
        #[serde(rename = "sessionId")]
        session_id: &'a str,
        #[serde(rename = "messageId")]
        message_id: &'a str,
        #[serde(rename = "nativeMessageId")]
        native_message_id: &'a str,
        #[serde(rename = "deletedAt")]
        deleted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventAck {
    #[serde(default)]
    native_message_id: Option<String>,
}

pub struct HttpBridge {
    config: HttpBridgeConfig,
    client: reqwest::Client,
}

impl HttpBridge {
    pub fn new(config: HttpBridgeConfig) -> BridgeResult<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn events_url(&self) -> String {
        format!("{}/api/events", self.config.base_url.trim_end_matches('/'))
    }

    async fn post(&self, event: &BridgeEvent<'_>) -> BridgeResult<Option<NativeMessageId>> {
        let mut request = self.client.post(self.events_url()).json(event);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        let ack: EventAck = serde_json::from_slice(&body).unwrap_or_default();
        debug!(
            component = "bridge",
            event = "bridge.http.ack",
            bridge = %self.config.name,
            native_message_id = ?ack.native_message_id,
            "Remote bridge acknowledged event"
        );
        Ok(ack.native_message_id.map(NativeMessageId))
    }
}

#[async_trait]
impl Bridge for HttpBridge {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn on_new_session(&self, session: &Session) -> BridgeResult<()> {
        self.post(&BridgeEvent::NewSession { session }).await?;
        Ok(())
    }

    async fn on_visitor_message(
        &self,
        message: &Message,
        session: &Session,
        reply: Option<&ReplyContext>,
    ) -> BridgeResult<Option<NativeMessageId>> {
        self.post(&BridgeEvent::VisitorMessage {
            message,
            session,
            reply_to_native_id: reply.and_then(|r| r.native_id.as_ref()).map(|id| id.as_str()),
            reply_quote: reply.map(|r| r.quote.as_str()),
        })
        .await
    }

    async fn on_operator_message(
        &self,
        message: &Message,
        session: &Session,
        source_bridge: &str,
        operator_name: Option<&str>,
    ) -> BridgeResult<Option<NativeMessageId>> {
        self.post(&BridgeEvent::OperatorMessage {
            message,
            session,
            source_bridge,
            operator_name,
        })
        .await
    }

    async fn on_typing(&self, session_id: &str, is_typing: bool) -> BridgeResult<()> {
        self.post(&BridgeEvent::Typing {
            session_id,
            is_typing,
        })
        .await?;
        Ok(())
    }

    async fn on_message_read(
        &self,
        session_id: &str,
        message_ids: &[String],
        status: MessageStatus,
    ) -> BridgeResult<()> {
        self.post(&BridgeEvent::MessageRead {
            session_id,
            message_ids,
            status,
        })
        .await?;
        Ok(())
    }

    async fn on_custom_event(&self, event: &CustomEvent, session: &Session) -> BridgeResult<()> {
        self.post(&BridgeEvent::CustomEvent { event, session }).await?;
        Ok(())
    }

    async fn on_identity_update(&self, session: &Session) -> BridgeResult<()> {
        self.post(&BridgeEvent::IdentityUpdate { session }).await?;
        Ok(())
    }

    async fn on_message_edited(
        &self,
        session_id: &str,
        message_id: &str,
        native_id: &NativeMessageId,
        content: &str,
    ) -> BridgeResult<()> {
        self.post(&BridgeEvent::VisitorMessageEdited {
            session_id,
            message_id,
            native_message_id: native_id.as_str(),
            content,
            edited_at: Utc::now(),
        })
        .await?;
        Ok(())
    }

    async fn on_message_deleted(
        &self,
        session_id: &str,
        message_id: &str,
        native_id: &NativeMessageId,
    ) -> BridgeResult<()> {
        self.post(&BridgeEvent::VisitorMessageDeleted {
            session_id,
            message_id,
            native_message_id: native_id.as_str(),
            deleted_at: Utc::now(),
        })
        .await?;
        Ok(())
    }
}
