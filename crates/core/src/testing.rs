//! Recording bridge shared by the dispatcher and service tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pocketping_bridge_core::{
    Bridge, BridgeError, BridgeResult, NativeMessageId, ReplyContext,
};
use pocketping_protocol::{CustomEvent, Message, MessageStatus, Session};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    NewSession(String),
    VisitorMessage {
        message_id: String,
        content: String,
        reply_native: Option<String>,
        quote: Option<String>,
    },
    OperatorMessage {
        message_id: String,
        content: String,
        source_bridge: String,
    },
    Typing(bool),
    Read(Vec<String>, MessageStatus),
    CustomEvent(String),
    IdentityUpdate(String),
    Edited {
        message_id: String,
        native: String,
        content: String,
    },
    Deleted {
        message_id: String,
        native: String,
    },
}

pub(crate) struct RecordingBridge {
    name: String,
    calls: Mutex<Vec<Call>>,
    delay: Option<Duration>,
    fail: bool,
    panic: bool,
    assign_native: bool,
    next_native: AtomicU64,
}

impl RecordingBridge {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            delay: None,
            fail: false,
            panic: false,
            assign_native: true,
            next_native: AtomicU64::new(1),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub(crate) fn without_native_ids(mut self) -> Self {
        self.assign_native = false;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: Call) -> BridgeResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic {
            panic!("bridge {} exploded", self.name);
        }
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(BridgeError::Other("platform unavailable".into()));
        }
        Ok(())
    }

    fn native(&self) -> Option<NativeMessageId> {
        self.assign_native.then(|| {
            let n = self.next_native.fetch_add(1, Ordering::SeqCst);
            NativeMessageId::new(format!("{}-{}", self.name, n))
        })
    }
}

#[async_trait]
impl Bridge for RecordingBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_new_session(&self, session: &Session) -> BridgeResult<()> {
        self.record(Call::NewSession(session.id.clone())).await
    }

    async fn on_visitor_message(
        &self,
        message: &Message,
        _session: &Session,
        reply: Option<&ReplyContext>,
    ) -> BridgeResult<Option<NativeMessageId>> {
        self.record(Call::VisitorMessage {
            message_id: message.id.clone(),
            content: message.content.clone(),
            reply_native: reply
                .and_then(|r| r.native_id.as_ref())
                .map(|n| n.to_string()),
            quote: reply.map(|r| r.quote.clone()),
        })
        .await?;
        Ok(self.native())
    }

    async fn on_operator_message(
        &self,
        message: &Message,
        _session: &Session,
        source_bridge: &str,
        _operator_name: Option<&str>,
    ) -> BridgeResult<Option<NativeMessageId>> {
        self.record(Call::OperatorMessage {
            message_id: message.id.clone(),
            content: message.content.clone(),
            source_bridge: source_bridge.to_string(),
        })
        .await?;
        Ok(self.native())
    }

    async fn on_typing(&self, _session_id: &str, is_typing: bool) -> BridgeResult<()> {
        self.record(Call::Typing(is_typing)).await
    }

    async fn on_message_read(
        &self,
        _session_id: &str,
        message_ids: &[String],
        status: MessageStatus,
    ) -> BridgeResult<()> {
        self.record(Call::Read(message_ids.to_vec(), status)).await
    }

    async fn on_custom_event(&self, event: &CustomEvent, _session: &Session) -> BridgeResult<()> {
        self.record(Call::CustomEvent(event.name.clone())).await
    }

    async fn on_identity_update(&self, session: &Session) -> BridgeResult<()> {
        let id = session
            .identity
            .as_ref()
            .map(|i| i.id.clone())
            .unwrap_or_default();
        self.record(Call::IdentityUpdate(id)).await
    }

    async fn on_message_edited(
        &self,
        _session_id: &str,
        message_id: &str,
        native_id: &NativeMessageId,
        content: &str,
    ) -> BridgeResult<()> {
        self.record(Call::Edited {
            message_id: message_id.to_string(),
            native: native_id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    async fn on_message_deleted(
        &self,
        _session_id: &str,
        message_id: &str,
        native_id: &NativeMessageId,
    ) -> BridgeResult<()> {
        self.record(Call::Deleted {
            message_id: message_id.to_string(),
            native: native_id.to_string(),
        })
        .await
    }
}
