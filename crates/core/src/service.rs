//! ChatService: the coordinator every transport handler calls into.
//!
//! Each operation writes the store first, then pushes to live connections
//! and queues bridge notifications. Bridge delivery never fails a request.
//! The operator-online flag and the connection registry live here, created
//! with the service and torn down by [`ChatService::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pocketping_bridge_core::{reply_quote, Bridge, BridgeError};
use pocketping_protocol::client::{
    ConnectRequest, ConnectResponse, GetMessagesQuery, GetMessagesResponse, PresenceResponse,
    ReadRequest,
};
use pocketping_protocol::server::{
    MessageDeletedData, MessageEditedData, PresenceData, ReadData, TypingData,
};
use pocketping_protocol::{
    new_id, CustomEvent, Message, MessageStatus, Sender, ServerEvent, Session, UserIdentity,
    VersionStatus, VersionWarning,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Origin, ReplyTarget};
use crate::error::{Error, Result};
use crate::events::{EventHandler, HandlerTable, Subscription};
use crate::gateway::Gateway;
use crate::identity_map::IdentityMap;
use crate::ip_filter::{FilterDecision, IpFilter};
use crate::registry::BridgeRegistry;
use crate::store::MessageStore;
use crate::ua_filter::UaFilter;
use crate::user_agent;
use crate::version::{check_widget_version, version_warning, VersionCheck};
use crate::webhook::WebhookForwarder;

pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 4000;
/// Messages returned with a connect response.
pub const CONNECT_HISTORY: usize = 50;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub welcome_message: Option<String>,
    pub max_content_length: usize,
    pub min_widget_version: Option<String>,
    pub latest_widget_version: Option<String>,
    pub version_warning_message: Option<String>,
    pub version_upgrade_url: Option<String>,
    pub ip_filter: IpFilter,
    pub ua_filter: UaFilter,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            welcome_message: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            min_widget_version: None,
            latest_widget_version: None,
            version_warning_message: None,
            version_upgrade_url: None,
            ip_filter: IpFilter::default(),
            ua_filter: UaFilter::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub response: ConnectResponse,
    pub version: VersionCheck,
    /// Present when the widget is behind the configured versions.
    pub warning: Option<VersionWarning>,
    pub created: bool,
}

pub struct ChatService {
    pub(crate) config: ServiceConfig,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) identity: Arc<IdentityMap>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) gateway: Arc<Gateway>,
    webhook: Option<Arc<WebhookForwarder>>,
    handlers: Arc<HandlerTable>,
    operator_online: AtomicBool,
}

impl ChatService {
    pub fn new(config: ServiceConfig, store: Arc<dyn MessageStore>) -> Self {
        let identity = Arc::new(IdentityMap::new());
        let registry = Arc::new(BridgeRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry, identity.clone()));
        Self {
            config,
            store,
            identity,
            dispatcher,
            gateway: Arc::new(Gateway::new()),
            webhook: None,
            handlers: Arc::new(HandlerTable::default()),
            operator_online: AtomicBool::new(false),
        }
    }

    pub fn with_webhook(mut self, webhook: WebhookForwarder) -> Self {
        self.webhook = Some(Arc::new(webhook));
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn identity_map(&self) -> &Arc<IdentityMap> {
        &self.identity
    }

    // -- Bridges --

    pub async fn add_bridge(&self, bridge: Arc<dyn Bridge>) -> std::result::Result<(), BridgeError> {
        self.dispatcher.add_bridge(bridge).await
    }

    pub async fn remove_bridge(&self, name: &str) -> bool {
        self.dispatcher.remove_bridge(name).await
    }

    pub fn bridge_names(&self) -> Vec<String> {
        self.dispatcher.registry().names()
    }

    // -- Widget operations --

    /// Resume by session ID, then by visitor ID, else create a session.
    pub async fn connect(
        &self,
        request: ConnectRequest,
        client_ip: Option<&str>,
    ) -> Result<ConnectOutcome> {
        if let Some(ip) = client_ip {
            if let FilterDecision::Deny(reason) = self.config.ip_filter.check(ip) {
                warn!(
                    component = "service",
                    event = "connect.ip_blocked",
                    ip = %ip,
                    reason = reason.as_str(),
                    "Connect rejected by IP filter"
                );
                return Err(Error::Rejected(format!("ip address blocked ({})", reason.as_str())));
            }
        }
        if let Some(user_agent) = request
            .metadata
            .as_ref()
            .and_then(|meta| meta.user_agent.as_deref())
        {
            self.check_user_agent(user_agent)?;
        }

        let version = check_widget_version(
            request.widget_version.as_deref(),
            self.config.min_widget_version.as_deref(),
            self.config.latest_widget_version.as_deref(),
            self.config.version_warning_message.as_deref(),
        );
        if !version.can_continue {
            return Err(Error::Rejected(
                version
                    .message
                    .clone()
                    .unwrap_or_else(|| "widget version unsupported".to_string()),
            ));
        }

        if request.visitor_id.trim().is_empty() {
            return Err(Error::Validation("visitorId is required".into()));
        }

        let mut existing = match request.session_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => self.store.get_session(id).await?,
            None => None,
        };
        if existing.is_none() {
            existing = self
                .store
                .get_session_by_visitor_id(&request.visitor_id)
                .await?;
        }

        let now = Utc::now();
        let mut metadata = request.metadata;
        if let Some(meta) = metadata.as_mut() {
            user_agent::enrich(meta);
            if meta.ip.is_none() {
                meta.ip = client_ip.map(str::to_string);
            }
        }

        let (session, created) = match existing {
            Some(mut session) => {
                if metadata.is_some() || request.identity.is_some() {
                    let identity = request.identity;
                    let update = move |session: &mut Session| {
                        if let Some(mut meta) = metadata {
                            if let Some(previous) = &session.metadata {
                                // Server-side geo fields survive a client refresh.
                                if previous.ip.is_some() {
                                    meta.ip = previous.ip.clone();
                                }
                                if previous.country.is_some() {
                                    meta.country = previous.country.clone();
                                }
                                if previous.city.is_some() {
                                    meta.city = previous.city.clone();
                                }
                            }
                            session.metadata = Some(meta);
                        }
                        if let Some(identity) = identity {
                            session.identity = Some(identity);
                        }
                        session.last_activity = now;
                    };
                    session = self
                        .store
                        .update_session_with(&session.id, Box::new(update))
                        .await?;
                }
                debug!(
                    component = "service",
                    event = "session.resumed",
                    session_id = %session.id,
                    visitor_id = %session.visitor_id,
                    "Session resumed"
                );
                (session, false)
            }
            None => {
                let mut session = Session::new(new_id(), request.visitor_id, now);
                session.operator_online = self.is_operator_online();
                session.metadata = metadata;
                session.identity = request.identity;
                self.store.create_session(session.clone()).await?;
                self.dispatcher.notify_new_session(&session);
                info!(
                    component = "service",
                    event = "session.created",
                    session_id = %session.id,
                    visitor_id = %session.visitor_id,
                    "Session created"
                );
                (session, true)
            }
        };

        let messages = self.recent_messages(&session.id, CONNECT_HISTORY).await?;

        let warning = (version.status != VersionStatus::Ok).then(|| {
            version_warning(
                &version,
                request.widget_version.as_deref().unwrap_or_default(),
                self.config.version_upgrade_url.as_deref(),
            )
        });
        if let Some(warning) = &warning {
            self.gateway
                .broadcast(&session.id, &ServerEvent::VersionWarning(warning.clone()));
        }

        Ok(ConnectOutcome {
            response: ConnectResponse {
                session_id: session.id,
                visitor_id: session.visitor_id,
                operator_online: self.is_operator_online(),
                welcome_message: self.config.welcome_message.clone(),
                messages,
            },
            version,
            warning,
            created,
        })
    }

    /// Refuse agents the User-Agent filter blocks.
    pub fn check_user_agent(&self, user_agent: &str) -> Result<()> {
        let verdict = self.config.ua_filter.check(user_agent);
        if let FilterDecision::Deny(reason) = verdict.decision {
            warn!(
                component = "service",
                event = "connect.ua_blocked",
                user_agent = %user_agent,
                reason = reason.as_str(),
                pattern = ?verdict.pattern,
                "Connect rejected by User-Agent filter"
            );
            return Err(Error::Rejected(format!(
                "user agent blocked ({})",
                reason.as_str()
            )));
        }
        Ok(())
    }

    /// Store a widget message, push it to live connections and, for visitor
    /// messages, queue it for every bridge.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        sender: Sender,
        reply_to: Option<&str>,
    ) -> Result<Message> {
        self.validate_content(content)?;
        self.require_session(session_id).await?;

        let now = Utc::now();
        let mut message = Message::new(
            new_id(),
            session_id.to_string(),
            sender,
            content.to_string(),
            now,
        );
        message.reply_to = reply_to.filter(|id| !id.is_empty()).map(str::to_string);
        self.store.save_message(message.clone()).await?;

        let session = self
            .store
            .update_session_with(
                session_id,
                Box::new(move |session: &mut Session| {
                    session.last_activity = now;
                    if sender == Sender::Operator {
                        session.ai_active = false;
                    }
                }),
            )
            .await?;

        if sender == Sender::Visitor {
            let reply = self
                .reply_target(session_id, message.reply_to.as_deref())
                .await?;
            self.dispatcher
                .notify_visitor_message(&message, &session, reply);
        }
        self.gateway
            .broadcast(session_id, &ServerEvent::Message(message.clone()));

        Ok(message)
    }

    /// Pull model: messages after a cursor, `limit` clamped to 1..=100.
    pub async fn list_messages(&self, query: &GetMessagesQuery) -> Result<GetMessagesResponse> {
        self.require_session(&query.session_id).await?;
        let limit = query
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE);

        let mut messages = self
            .store
            .get_messages(&query.session_id, query.after.as_deref(), limit + 1)
            .await?;
        let has_more = messages.len() > limit;
        messages.truncate(limit);

        Ok(GetMessagesResponse { messages, has_more })
    }

    /// Edit a visitor's own message. ID, sender and position are unchanged.
    pub async fn edit_message(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message> {
        self.validate_content(content)?;
        self.require_session(session_id).await?;
        let mut message = self.owned_visitor_message(session_id, message_id).await?;
        if message.is_deleted() {
            return Err(Error::InvalidState(format!("message {message_id} is deleted")));
        }

        let now = Utc::now();
        message.content = content.to_string();
        message.edited_at = Some(now);
        self.store.save_message(message.clone()).await?;

        self.dispatcher
            .notify_edit(session_id, message_id, content, &Origin::Visitor);
        self.gateway.broadcast(
            session_id,
            &ServerEvent::MessageEdited(MessageEditedData {
                message_id: message.id.clone(),
                content: message.content.clone(),
                edited_at: now,
            }),
        );
        Ok(message)
    }

    /// Soft-delete a visitor's own message: content cleared, row kept.
    /// Deleting an already deleted message is a no-op.
    pub async fn delete_message(&self, session_id: &str, message_id: &str) -> Result<Message> {
        self.require_session(session_id).await?;
        let mut message = self.owned_visitor_message(session_id, message_id).await?;
        if message.is_deleted() {
            return Ok(message);
        }

        let now = Utc::now();
        message.content.clear();
        message.deleted_at = Some(now);
        self.store.save_message(message.clone()).await?;

        self.dispatcher
            .notify_delete(session_id, message_id, &Origin::Visitor);
        self.gateway.broadcast(
            session_id,
            &ServerEvent::MessageDeleted(MessageDeletedData {
                message_id: message.id.clone(),
                deleted_at: now,
            }),
        );
        Ok(message)
    }

    /// Apply delivered/read receipts. Messages of other sessions and
    /// messages already at or past the status are skipped.
    pub async fn mark_read(&self, request: &ReadRequest) -> Result<usize> {
        self.require_session(&request.session_id).await?;
        let status = request.status.unwrap_or(MessageStatus::Read);
        if !matches!(status, MessageStatus::Delivered | MessageStatus::Read) {
            return Err(Error::Validation(
                "status must be delivered or read".to_string(),
            ));
        }

        let now = Utc::now();
        let mut updated = Vec::new();
        for id in &request.message_ids {
            let Some(mut message) = self.store.get_message(id).await? else {
                continue;
            };
            if message.session_id != request.session_id || message.status >= status {
                continue;
            }

            message.status = status;
            if message.delivered_at.is_none() {
                message.delivered_at = Some(now);
            }
            if status == MessageStatus::Read {
                message.read_at = Some(now);
            }
            self.store.save_message(message).await?;
            updated.push(id.clone());
        }

        if !updated.is_empty() {
            self.gateway.broadcast(
                &request.session_id,
                &ServerEvent::Read(ReadData {
                    session_id: request.session_id.clone(),
                    message_ids: updated.clone(),
                    status,
                    delivered_at: Some(now),
                    read_at: (status == MessageStatus::Read).then_some(now),
                }),
            );
            self.dispatcher
                .notify_read(&request.session_id, &updated, status, &Origin::Visitor);
        }
        Ok(updated.len())
    }

    pub async fn typing(&self, session_id: &str, sender: Sender, is_typing: bool) -> Result<()> {
        self.require_session(session_id).await?;
        self.gateway.broadcast(
            session_id,
            &ServerEvent::Typing(TypingData {
                session_id: session_id.to_string(),
                sender,
                is_typing,
            }),
        );
        if sender == Sender::Visitor {
            self.dispatcher
                .notify_typing(session_id, is_typing, &Origin::Visitor);
        }
        Ok(())
    }

    /// Attach a user identity to the session.
    pub async fn identify(&self, session_id: &str, identity: Option<UserIdentity>) -> Result<Session> {
        let identity = identity
            .filter(|i| !i.id.trim().is_empty())
            .ok_or_else(|| Error::Validation("identity.id is required".to_string()))?;

        let stored = identity.clone();
        let session = self
            .store
            .update_session_with(
                session_id,
                Box::new(move |session: &mut Session| {
                    session.identity = Some(stored);
                    session.last_activity = Utc::now();
                }),
            )
            .await?;

        self.dispatcher.notify_identity_update(&session);
        let event = CustomEvent {
            name: "identify".to_string(),
            data: identity.to_map(),
            timestamp: Utc::now(),
            session_id: Some(session.id.clone()),
        };
        self.forward_to_webhook(event, session.clone());
        Ok(session)
    }

    pub fn presence(&self) -> PresenceResponse {
        PresenceResponse {
            online: self.is_operator_online(),
            ai_enabled: false,
        }
    }

    pub fn is_operator_online(&self) -> bool {
        self.operator_online.load(Ordering::Acquire)
    }

    /// Flip the operator flag and tell every connected widget.
    pub fn set_operator_online(&self, online: bool) {
        let previous = self.operator_online.swap(online, Ordering::AcqRel);
        if previous != online {
            info!(
                component = "service",
                event = "operator.presence",
                online,
                "Operator presence changed"
            );
        }
        self.gateway
            .broadcast_all(&ServerEvent::Presence(PresenceData { online }));
    }

    // -- Custom events --

    /// Register a handler for widget events named `name` (or `*`).
    pub fn on_event(&self, name: &str, handler: EventHandler) -> Subscription {
        self.handlers.subscribe(name, handler)
    }

    /// Widget → server event: handlers, bridges, then the webhook.
    pub async fn handle_custom_event(
        &self,
        session_id: &str,
        name: &str,
        data: Map<String, Value>,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Validation("event name is required".to_string()));
        }
        let session = self.require_session(session_id).await?;
        let event = CustomEvent {
            name: name.to_string(),
            data,
            timestamp: Utc::now(),
            session_id: Some(session_id.to_string()),
        };

        let handled = self.handlers.dispatch(&event, &session);
        debug!(
            component = "service",
            event = "custom_event.received",
            session_id = %session_id,
            name = %name,
            handlers = handled,
            "Custom event received"
        );
        self.dispatcher.notify_custom_event(&event, &session);
        self.forward_to_webhook(event, session);
        Ok(())
    }

    /// Server → widget event for one session.
    pub fn emit_event(&self, session_id: &str, name: &str, data: Map<String, Value>) -> usize {
        let event = CustomEvent {
            name: name.to_string(),
            data,
            timestamp: Utc::now(),
            session_id: Some(session_id.to_string()),
        };
        self.gateway.broadcast(session_id, &ServerEvent::Event(event))
    }

    /// Server → widget event for every connected session.
    pub fn broadcast_event(&self, name: &str, data: Map<String, Value>) -> usize {
        self.gateway
            .session_ids()
            .iter()
            .map(|session_id| self.emit_event(session_id, name, data.clone()))
            .sum()
    }

    // -- Lifecycle --

    pub async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        self.store.get_session(session_id).await
    }

    /// Remove one session with its messages, identity rows, lanes and
    /// live connections.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let messages = self.store.get_messages(session_id, None, usize::MAX).await?;
        self.store.delete_session(session_id).await?;
        self.identity.forget(messages.iter().map(|m| m.id.as_str()));
        self.dispatcher.forget_session(session_id);
        self.gateway.disconnect_session(session_id);
        Ok(())
    }

    /// Retention sweep. Returns the number of sessions removed.
    pub async fn cleanup_old_sessions(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.cleanup_old_sessions(older_than).await?;
        if removed.is_empty() {
            return Ok(0);
        }

        for session_id in &removed {
            self.dispatcher.forget_session(session_id);
            self.gateway.disconnect_session(session_id);
        }

        let mut orphaned = Vec::new();
        for message_id in self.identity.message_ids() {
            if self.store.get_message(&message_id).await?.is_none() {
                orphaned.push(message_id);
            }
        }
        self.identity.forget(orphaned.iter().map(String::as_str));

        info!(
            component = "service",
            event = "retention.swept",
            sessions = removed.len(),
            identity_rows = orphaned.len(),
            "Retention sweep removed old sessions"
        );
        Ok(removed.len())
    }

    /// Drain queued bridge deliveries and destroy every bridge.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    // -- Helpers --

    pub(crate) fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(Error::Validation("content is required".to_string()));
        }
        let max = self.config.max_content_length;
        if content.chars().count() > max {
            return Err(Error::Validation(format!(
                "content exceeds {max} characters"
            )));
        }
        Ok(())
    }

    pub(crate) async fn require_session(&self, session_id: &str) -> Result<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// The message must belong to `session_id` and be a visitor message.
    async fn owned_visitor_message(&self, session_id: &str, message_id: &str) -> Result<Message> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
        if message.session_id != session_id {
            return Err(Error::Unauthorized(format!(
                "message {message_id} does not belong to session {session_id}"
            )));
        }
        if message.sender != Sender::Visitor {
            return Err(Error::InvalidState(format!(
                "message {message_id} was not sent by the visitor"
            )));
        }
        Ok(message)
    }

    async fn reply_target(
        &self,
        session_id: &str,
        reply_to: Option<&str>,
    ) -> Result<Option<ReplyTarget>> {
        let Some(reply_to) = reply_to else {
            return Ok(None);
        };
        Ok(self
            .store
            .get_message(reply_to)
            .await?
            .filter(|target| target.session_id == session_id)
            .map(|target| ReplyTarget {
                quote: reply_quote(&target),
                message_id: target.id,
            }))
    }

    async fn recent_messages(&self, session_id: &str, count: usize) -> Result<Vec<Message>> {
        let all = self.store.get_messages(session_id, None, usize::MAX).await?;
        let skip = all.len().saturating_sub(count);
        Ok(all.into_iter().skip(skip).collect())
    }

    fn forward_to_webhook(&self, event: CustomEvent, session: Session) {
        let Some(webhook) = self.webhook.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = webhook.forward(&event, &session).await {
                warn!(
                    component = "webhook",
                    event = "webhook.forward.failed",
                    session_id = %session.id,
                    name = %event.name,
                    error = %e,
                    "Webhook forward failed"
                );
            }
        });
    }
}
