//! Forwards custom events to the operator's webhook.
//!
//! Bodies are signed with HMAC-SHA256 when a secret is configured:
//! `X-PocketPing-Signature: sha256=<hex>`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use pocketping_protocol::{CustomEvent, Session, SessionMetadata, UserIdentity};
use ring::hmac;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "X-PocketPing-Signature";
const DEFAULT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),

    #[error("webhook payload encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    event: &'a CustomEvent,
    session: WebhookSession<'a>,
    sent_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookSession<'a> {
    id: &'a str,
    visitor_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a SessionMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<&'a UserIdentity>,
}

pub struct WebhookForwarder {
    url: String,
    key: Option<hmac::Key>,
    client: reqwest::Client,
}

impl WebhookForwarder {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let key = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()));
        Ok(Self {
            url: config.url.clone(),
            key,
            client,
        })
    }

    pub async fn forward(&self, event: &CustomEvent, session: &Session) -> Result<(), WebhookError> {
        let body = encode_payload(event, session, Utc::now())?;

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.key {
            request = request.header(SIGNATURE_HEADER, sign(key, &body));
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

fn encode_payload(
    event: &CustomEvent,
    session: &Session,
    sent_at: DateTime<Utc>,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&WebhookPayload {
        event,
        session: WebhookSession {
            id: &session.id,
            visitor_id: &session.visitor_id,
            metadata: session.metadata.as_ref(),
            identity: session.identity.as_ref(),
        },
        sent_at,
    })
}

/// `sha256=<hex hmac of body>`
pub fn sign(key: &hmac::Key, body: &[u8]) -> String {
    let tag = hmac::sign(key, body);
    format!("sha256={}", hex::encode(tag.as_ref()))
}
