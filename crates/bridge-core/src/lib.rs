//! PocketPing Bridges
//!
//! The capability interface every platform bridge (Telegram, Discord,
//! Slack, ...) implements. All methods have no-op defaults so a bridge
//! only overrides the notifications it cares about.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use pocketping_protocol::{CustomEvent, Message, MessageStatus, Session};
use thiserror::Error;

pub use http::{HttpBridge, HttpBridgeConfig};

/// Errors that can occur while talking to an external platform
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Platform returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation not supported by bridge {0}")]
    Unsupported(String),

    #[error("Bridge error: {0}")]
    Other(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// A platform's own handle for a delivered message (Telegram message_id,
/// Discord snowflake, Slack ts, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeMessageId(pub String);

impl NativeMessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NativeMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NativeMessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reply metadata handed to a bridge when a visitor answers an earlier message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    /// This bridge's handle for the replied-to message, if it delivered it.
    pub native_id: Option<NativeMessageId>,
    /// Human readable quote line, e.g. `> *Support* — Hi there`.
    pub quote: String,
}

/// Notification channel to one external chat platform.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Unique name, also used as the echo-suppression key.
    fn name(&self) -> &str;

    /// Called once when the bridge is registered.
    async fn init(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn on_new_session(&self, _session: &Session) -> BridgeResult<()> {
        Ok(())
    }

    /// Returns the platform handle of the posted message so later edits,
    /// deletes and replies can target it.
    async fn on_visitor_message(
        &self,
        _message: &Message,
        _session: &Session,
        _reply: Option<&ReplyContext>,
    ) -> BridgeResult<Option<NativeMessageId>> {
        Ok(None)
    }

    /// An operator answered from another bridge (cross-bridge sync).
    async fn on_operator_message(
        &self,
        _message: &Message,
        _session: &Session,
        _source_bridge: &str,
        _operator_name: Option<&str>,
    ) -> BridgeResult<Option<NativeMessageId>> {
        Ok(None)
    }

    async fn on_typing(&self, _session_id: &str, _is_typing: bool) -> BridgeResult<()> {
        Ok(())
    }

    async fn on_message_read(
        &self,
        _session_id: &str,
        _message_ids: &[String],
        _status: MessageStatus,
    ) -> BridgeResult<()> {
        Ok(())
    }

    async fn on_custom_event(&self, _event: &CustomEvent, _session: &Session) -> BridgeResult<()> {
        Ok(())
    }

    async fn on_identity_update(&self, _session: &Session) -> BridgeResult<()> {
        Ok(())
    }

    /// Project an edit onto the platform message identified by `native_id`.
    async fn on_message_edited(
        &self,
        _session_id: &str,
        _message_id: &str,
        _native_id: &NativeMessageId,
        _content: &str,
    ) -> BridgeResult<()> {
        Ok(())
    }

    /// Project a delete onto the platform message identified by `native_id`.
    async fn on_message_deleted(
        &self,
        _session_id: &str,
        _message_id: &str,
        _native_id: &NativeMessageId,
    ) -> BridgeResult<()> {
        Ok(())
    }

    /// Called when the bridge is removed or the service shuts down.
    async fn destroy(&self) -> BridgeResult<()> {
        Ok(())
    }
}

/// Build the quote line bridges prepend to a visitor reply.
pub fn reply_quote(target: &Message) -> String {
    const PREVIEW_CHARS: usize = 140;

    let preview = if target.is_deleted() {
        "Message deleted".to_string()
    } else if target.content.chars().count() > PREVIEW_CHARS {
        let cut: String = target.content.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        target.content.clone()
    };

    format!("> *{}* — {}", target.sender.quote_label(), preview)
}
