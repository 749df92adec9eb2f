//! Dispatcher: fans domain events out to every registered bridge.
//!
//! Each `(bridge, session)` pair owns a lane: an unbounded queue drained by
//! one task, so events for the same bridge and session reach the platform
//! in the order they were notified while other pairs run in parallel.
//! Every bridge call runs in its own task; an error or panic is logged and
//! never reaches the caller or sibling bridges.
//!
//! Notify methods are synchronous and return as soon as the event is queued.
//! A lane that stays empty for the idle timeout retires itself and is
//! re-created on the next event for its pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pocketping_bridge_core::{Bridge, BridgeError, BridgeResult, ReplyContext};
use pocketping_protocol::{CustomEvent, Message, MessageStatus, Session};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::identity_map::IdentityMap;
use crate::registry::BridgeRegistry;

/// Where an event came from. A bridge never receives events it originated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Widget or server side, delivered to every bridge.
    Visitor,
    Bridge(String),
}

impl Origin {
    pub fn bridge(name: impl Into<String>) -> Self {
        Origin::Bridge(name.into())
    }

    fn skips(&self, bridge: &str) -> bool {
        matches!(self, Origin::Bridge(name) if name == bridge)
    }
}

/// The message a visitor message answers, resolved per bridge at delivery.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    pub message_id: String,
    pub quote: String,
}

#[derive(Debug)]
enum DispatchEvent {
    NewSession {
        session: Session,
    },
    VisitorMessage {
        message: Message,
        session: Session,
        reply: Option<ReplyTarget>,
    },
    OperatorMessage {
        message: Message,
        session: Session,
        source_bridge: String,
        operator_name: Option<String>,
    },
    Typing {
        session_id: String,
        is_typing: bool,
    },
    Read {
        session_id: String,
        message_ids: Vec<String>,
        status: MessageStatus,
    },
    CustomEvent {
        event: CustomEvent,
        session: Session,
    },
    IdentityUpdate {
        session: Session,
    },
    Edit {
        session_id: String,
        message_id: String,
        content: String,
    },
    Delete {
        session_id: String,
        message_id: String,
    },
}

impl DispatchEvent {
    fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::NewSession { .. } => "new_session",
            DispatchEvent::VisitorMessage { .. } => "visitor_message",
            DispatchEvent::OperatorMessage { .. } => "operator_message",
            DispatchEvent::Typing { .. } => "typing",
            DispatchEvent::Read { .. } => "read",
            DispatchEvent::CustomEvent { .. } => "custom_event",
            DispatchEvent::IdentityUpdate { .. } => "identity_update",
            DispatchEvent::Edit { .. } => "edit",
            DispatchEvent::Delete { .. } => "delete",
        }
    }

    fn session_id(&self) -> &str {
        match self {
            DispatchEvent::NewSession { session }
            | DispatchEvent::CustomEvent { session, .. }
            | DispatchEvent::IdentityUpdate { session } => session.id.as_str(),
            DispatchEvent::VisitorMessage { message, .. }
            | DispatchEvent::OperatorMessage { message, .. } => message.session_id.as_str(),
            DispatchEvent::Typing { session_id, .. }
            | DispatchEvent::Read { session_id, .. }
            | DispatchEvent::Edit { session_id, .. }
            | DispatchEvent::Delete { session_id, .. } => session_id.as_str(),
        }
    }
}

enum Job {
    Deliver(Arc<DispatchEvent>),
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LaneKey {
    bridge: String,
    session_id: String,
}

const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Lane {
    id: u64,
    bridge: Arc<dyn Bridge>,
    tx: mpsc::UnboundedSender<Job>,
}

type Lanes = Arc<DashMap<LaneKey, Lane>>;

pub struct Dispatcher {
    registry: Arc<BridgeRegistry>,
    identity: Arc<IdentityMap>,
    lanes: Lanes,
    next_lane: AtomicU64,
    idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<BridgeRegistry>, identity: Arc<IdentityMap>) -> Self {
        Self {
            registry,
            identity,
            lanes: Arc::new(DashMap::new()),
            next_lane: AtomicU64::new(0),
            idle_timeout: LANE_IDLE_TIMEOUT,
        }
    }

    /// How long an empty lane waits for work before retiring.
    pub fn with_lane_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn registry(&self) -> &Arc<BridgeRegistry> {
        &self.registry
    }

    pub fn identity_map(&self) -> &Arc<IdentityMap> {
        &self.identity
    }

    pub fn notify_new_session(&self, session: &Session) {
        self.fan_out(
            &Origin::Visitor,
            DispatchEvent::NewSession {
                session: session.clone(),
            },
        );
    }

    pub fn notify_visitor_message(
        &self,
        message: &Message,
        session: &Session,
        reply: Option<ReplyTarget>,
    ) {
        self.fan_out(
            &Origin::Visitor,
            DispatchEvent::VisitorMessage {
                message: message.clone(),
                session: session.clone(),
                reply,
            },
        );
    }

    /// Cross-bridge sync of an operator reply; `source_bridge` is skipped.
    pub fn notify_operator_message(
        &self,
        message: &Message,
        session: &Session,
        source_bridge: &str,
        operator_name: Option<&str>,
    ) {
        self.fan_out(
            &Origin::bridge(source_bridge),
            DispatchEvent::OperatorMessage {
                message: message.clone(),
                session: session.clone(),
                source_bridge: source_bridge.to_string(),
                operator_name: operator_name.map(str::to_string),
            },
        );
    }

    pub fn notify_typing(&self, session_id: &str, is_typing: bool, origin: &Origin) {
        self.fan_out(
            origin,
            DispatchEvent::Typing {
                session_id: session_id.to_string(),
                is_typing,
            },
        );
    }

    pub fn notify_read(
        &self,
        session_id: &str,
        message_ids: &[String],
        status: MessageStatus,
        origin: &Origin,
    ) {
        self.fan_out(
            origin,
            DispatchEvent::Read {
                session_id: session_id.to_string(),
                message_ids: message_ids.to_vec(),
                status,
            },
        );
    }

    pub fn notify_custom_event(&self, event: &CustomEvent, session: &Session) {
        self.fan_out(
            &Origin::Visitor,
            DispatchEvent::CustomEvent {
                event: event.clone(),
                session: session.clone(),
            },
        );
    }

    pub fn notify_identity_update(&self, session: &Session) {
        self.fan_out(
            &Origin::Visitor,
            DispatchEvent::IdentityUpdate {
                session: session.clone(),
            },
        );
    }

    /// Bridges without a native handle for the message are skipped at delivery.
    pub fn notify_edit(&self, session_id: &str, message_id: &str, content: &str, origin: &Origin) {
        self.fan_out(
            origin,
            DispatchEvent::Edit {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                content: content.to_string(),
            },
        );
    }

    pub fn notify_delete(&self, session_id: &str, message_id: &str, origin: &Origin) {
        self.fan_out(
            origin,
            DispatchEvent::Delete {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            },
        );
    }

    pub async fn add_bridge(&self, bridge: Arc<dyn Bridge>) -> Result<(), BridgeError> {
        self.registry.add(bridge).await
    }

    /// Unregister a bridge, drop its lanes and destroy it.
    pub async fn remove_bridge(&self, name: &str) -> bool {
        self.lanes.retain(|key, _| key.bridge != name);
        self.registry.remove(name).await
    }

    /// Drop the lanes of a session. Already queued events still run.
    pub fn forget_session(&self, session_id: &str) {
        self.lanes.retain(|key, _| key.session_id != session_id);
    }

    /// Wait until every event queued so far has been handled.
    pub async fn drain(&self) {
        let waiters: Vec<_> = self
            .lanes
            .iter()
            .filter_map(|lane| {
                let (tx, rx) = oneshot::channel();
                lane.tx.send(Job::Barrier(tx)).ok().map(|_| rx)
            })
            .collect();
        futures::future::join_all(waiters).await;
    }

    /// Drain pending deliveries, then destroy every bridge.
    pub async fn shutdown(&self) {
        self.drain().await;
        self.lanes.clear();
        self.registry.destroy_all().await;
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn fan_out(&self, origin: &Origin, event: DispatchEvent) {
        let bridges = self.registry.snapshot();
        if bridges.is_empty() {
            return;
        }

        let event = Arc::new(event);
        for bridge in bridges.iter() {
            if origin.skips(bridge.name()) {
                debug!(
                    component = "dispatcher",
                    event = "dispatch.echo.skipped",
                    bridge = %bridge.name(),
                    session_id = %event.session_id(),
                    kind = event.kind(),
                    "Skipping originating bridge"
                );
                continue;
            }
            self.enqueue(bridge, Job::Deliver(event.clone()), event.session_id());
        }
    }

    fn enqueue(&self, bridge: &Arc<dyn Bridge>, job: Job, session_id: &str) {
        let key = LaneKey {
            bridge: bridge.name().to_string(),
            session_id: session_id.to_string(),
        };

        let mut lane = self
            .lanes
            .entry(key.clone())
            .or_insert_with(|| self.spawn_lane(key.clone(), bridge.clone()));

        // A bridge re-registered under the same name gets a fresh lane.
        if !Arc::ptr_eq(&lane.bridge, bridge) {
            *lane = self.spawn_lane(key, bridge.clone());
        }

        if lane.tx.send(job).is_err() {
            warn!(
                component = "dispatcher",
                event = "dispatch.lane.closed",
                bridge = %bridge.name(),
                session_id = %session_id,
                "Lane closed, event dropped"
            );
        }
    }

    fn spawn_lane(&self, key: LaneKey, bridge: Arc<dyn Bridge>) -> Lane {
        let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(LaneTask {
            key,
            id,
            lanes: self.lanes.clone(),
            bridge: bridge.clone(),
            identity: self.identity.clone(),
            idle_timeout: self.idle_timeout,
            rx,
        }));
        Lane { id, bridge, tx }
    }
}

struct LaneTask {
    key: LaneKey,
    id: u64,
    lanes: Lanes,
    bridge: Arc<dyn Bridge>,
    identity: Arc<IdentityMap>,
    idle_timeout: Duration,
    rx: mpsc::UnboundedReceiver<Job>,
}

async fn run_lane(mut lane: LaneTask) {
    loop {
        let job = match tokio::time::timeout(lane.idle_timeout, lane.rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(_) => {
                // Senders hold the map entry while queueing, so an empty
                // queue checked under the removal lock stays empty.
                let retired = lane
                    .lanes
                    .remove_if(&lane.key, |_, current| {
                        current.id == lane.id && lane.rx.is_empty()
                    })
                    .is_some();
                if retired {
                    debug!(
                        component = "dispatcher",
                        event = "dispatch.lane.retired",
                        bridge = %lane.key.bridge,
                        session_id = %lane.key.session_id,
                        "Idle lane retired"
                    );
                    return;
                }
                continue;
            }
        };
        match job {
            Job::Deliver(event) => deliver(&lane.bridge, &lane.identity, event).await,
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn deliver(bridge: &Arc<dyn Bridge>, identity: &Arc<IdentityMap>, event: Arc<DispatchEvent>) {
    let kind = event.kind();
    let session_id = event.session_id().to_string();
    let task = tokio::spawn(call_bridge(bridge.clone(), identity.clone(), event));

    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            component = "dispatcher",
            event = "dispatch.bridge.failed",
            bridge = %bridge.name(),
            session_id = %session_id,
            kind,
            error = %e,
            "Bridge notification failed"
        ),
        Err(e) if e.is_panic() => error!(
            component = "dispatcher",
            event = "dispatch.bridge.panicked",
            bridge = %bridge.name(),
            session_id = %session_id,
            kind,
            "Bridge panicked during notification"
        ),
        Err(_) => {}
    }
}

async fn call_bridge(
    bridge: Arc<dyn Bridge>,
    identity: Arc<IdentityMap>,
    event: Arc<DispatchEvent>,
) -> BridgeResult<()> {
    let name = bridge.name();
    match event.as_ref() {
        DispatchEvent::NewSession { session } => bridge.on_new_session(session).await,
        DispatchEvent::VisitorMessage {
            message,
            session,
            reply,
        } => {
            let context = reply.as_ref().map(|target| ReplyContext {
                native_id: identity.get_for(&target.message_id, name),
                quote: target.quote.clone(),
            });
            if let Some(native) = bridge
                .on_visitor_message(message, session, context.as_ref())
                .await?
            {
                identity.save(&message.id, name, native);
            }
            Ok(())
        }
        DispatchEvent::OperatorMessage {
            message,
            session,
            source_bridge,
            operator_name,
        } => {
            if let Some(native) = bridge
                .on_operator_message(message, session, source_bridge, operator_name.as_deref())
                .await?
            {
                identity.save(&message.id, name, native);
            }
            Ok(())
        }
        DispatchEvent::Typing {
            session_id,
            is_typing,
        } => bridge.on_typing(session_id, *is_typing).await,
        DispatchEvent::Read {
            session_id,
            message_ids,
            status,
        } => bridge.on_message_read(session_id, message_ids, *status).await,
        DispatchEvent::CustomEvent { event, session } => {
            bridge.on_custom_event(event, session).await
        }
        DispatchEvent::IdentityUpdate { session } => bridge.on_identity_update(session).await,
        DispatchEvent::Edit {
            session_id,
            message_id,
            content,
        } => match identity.get_for(message_id, name) {
            Some(native) => {
                bridge
                    .on_message_edited(session_id, message_id, &native, content)
                    .await
            }
            None => {
                debug!(
                    component = "dispatcher",
                    event = "dispatch.edit.unmapped",
                    bridge = %name,
                    message_id = %message_id,
                    "No native handle, skipping edit"
                );
                Ok(())
            }
        },
        DispatchEvent::Delete {
            session_id,
            message_id,
        } => match identity.get_for(message_id, name) {
            Some(native) => {
                bridge
                    .on_message_deleted(session_id, message_id, &native)
                    .await
            }
            None => {
                debug!(
                    component = "dispatcher",
                    event = "dispatch.delete.unmapped",
                    bridge = %name,
                    message_id = %message_id,
                    "No native handle, skipping delete"
                );
                Ok(())
            }
        },
    }
}
