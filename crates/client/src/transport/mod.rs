//! Network seams of the client.
//!
//! [`Api`] is the request/response side (REST). [`PushTransport`] opens the
//! server-to-widget stream over WebSocket or SSE. The event loop only talks to
//! these traits, so tests swap in scripted fakes.

mod http;
mod sse;
mod ws;

use async_trait::async_trait;
use futures::stream::BoxStream;
use pocketping_protocol::client::*;
use pocketping_protocol::ServerEvent;

use crate::error::{ClientError, Result};
use crate::negotiator::Transport;

pub use http::HttpApi;
pub use sse::{SseDecoder, SseFrame};

pub type EventStream = BoxStream<'static, Result<ServerEvent>>;

#[async_trait]
pub trait Api: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<ConnectResponse>;
    async fn send(&self, request: &SendMessageRequest) -> Result<SendMessageResponse>;
    async fn fetch_messages(&self, query: &GetMessagesQuery) -> Result<GetMessagesResponse>;
    async fn edit(
        &self,
        message_id: &str,
        request: &EditMessageRequest,
    ) -> Result<EditMessageResponse>;
    async fn delete(&self, session_id: &str, message_id: &str) -> Result<DeleteMessageResponse>;
    async fn read(&self, request: &ReadRequest) -> Result<ReadResponse>;
    async fn typing(&self, request: &TypingRequest) -> Result<()>;
    async fn identify(&self, request: &IdentifyRequest) -> Result<()>;
    async fn event(&self, request: &CustomEventRequest) -> Result<()>;
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Resolve once the stream is open. The stream ends when the server side
    /// closes; an `Err` item means it broke.
    async fn open(
        &self,
        transport: Transport,
        session_id: &str,
        cursor: Option<&str>,
    ) -> Result<EventStream>;
}

/// WebSocket and SSE against a PocketPing server.
#[derive(Debug, Clone)]
pub struct RemoteTransport {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PushTransport for RemoteTransport {
    async fn open(
        &self,
        transport: Transport,
        session_id: &str,
        cursor: Option<&str>,
    ) -> Result<EventStream> {
        match transport {
            Transport::WebSocket => ws::open(&self.base_url, session_id).await,
            Transport::Sse => sse::open(&self.http, &self.base_url, session_id, cursor).await,
            Transport::Polling => Err(ClientError::Transport(
                "polling has no push stream".to_string(),
            )),
        }
    }
}
