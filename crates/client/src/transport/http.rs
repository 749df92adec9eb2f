use std::time::Duration;

use async_trait::async_trait;
use pocketping_protocol::client::*;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::Api;
use crate::error::{ClientError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

/// Widget REST API over reqwest.
#[derive(Debug, Clone)]
pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let bytes = response.bytes().await?;
        Err(api_error(status, &bytes))
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> ClientError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(body) => ClientError::Api {
            status: status.as_u16(),
            code: body.error,
            message: body.message,
        },
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            code: status
                .canonical_reason()
                .unwrap_or("error")
                .to_ascii_lowercase()
                .replace(' ', "_"),
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

#[async_trait]
impl Api for HttpApi {
    async fn connect(&self, request: &ConnectRequest) -> Result<ConnectResponse> {
        debug!(
            component = "client",
            event = "client.http.connect",
            visitor_id = %request.visitor_id,
            "Connecting session"
        );
        self.call(self.client.post(self.url("/api/connect")).json(request))
            .await
    }

    async fn send(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        self.call(self.client.post(self.url("/api/message")).json(request))
            .await
    }

    async fn fetch_messages(&self, query: &GetMessagesQuery) -> Result<GetMessagesResponse> {
        let mut params = vec![("sessionId", query.session_id.clone())];
        if let Some(after) = &query.after {
            params.push(("after", after.clone()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        self.call(self.client.get(self.url("/api/messages")).query(&params))
            .await
    }

    async fn edit(
        &self,
        message_id: &str,
        request: &EditMessageRequest,
    ) -> Result<EditMessageResponse> {
        let url = self.url(&format!("/api/message/{message_id}"));
        self.call(self.client.patch(url).json(request)).await
    }

    async fn delete(&self, session_id: &str, message_id: &str) -> Result<DeleteMessageResponse> {
        let url = self.url(&format!("/api/message/{message_id}"));
        self.call(self.client.delete(url).query(&[("sessionId", session_id)]))
            .await
    }

    async fn read(&self, request: &ReadRequest) -> Result<ReadResponse> {
        self.call(self.client.post(self.url("/api/read")).json(request))
            .await
    }

    async fn typing(&self, request: &TypingRequest) -> Result<()> {
        let _: OkResponse = self
            .call(self.client.post(self.url("/api/typing")).json(request))
            .await?;
        Ok(())
    }

    async fn identify(&self, request: &IdentifyRequest) -> Result<()> {
        let _: OkResponse = self
            .call(self.client.post(self.url("/api/identify")).json(request))
            .await?;
        Ok(())
    }

    async fn event(&self, request: &CustomEventRequest) -> Result<()> {
        let _: OkResponse = self
            .call(self.client.post(self.url("/api/event")).json(request))
            .await?;
        Ok(())
    }
}
