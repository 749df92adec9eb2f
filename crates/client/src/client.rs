//! `ChatClient`: the widget's side of a PocketPing conversation.
//!
//! Each connected session runs one event loop task that owns the transport
//! negotiator, the reconciler and the poller, so the message list is only
//! ever mutated in one place. Callers reach the loop over an mpsc channel
//! (oneshot replies where they need an answer) and read lock-free snapshots
//! through `ArcSwap`.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use futures::StreamExt;
use pocketping_protocol::client::*;
use pocketping_protocol::server::{MessageDeletedData, MessageEditedData, ReadData};
use pocketping_protocol::{
    CustomEvent, Message, MessageStatus, Sender, ServerEvent, SessionMetadata, UserIdentity,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::listeners::{Listeners, Subscription};
use crate::negotiator::{self, ConnectionStatus, Effect, Input, NegotiatorState, Phase, Transport};
use crate::poller::{PollDecision, Poller};
use crate::reconciler::{Applied, Reconciler};
use crate::transport::{Api, HttpApi, PushTransport, RemoteTransport};

const COMMAND_BUFFER: usize = 64;
const PUSH_BUFFER: usize = 256;
const FETCH_BUFFER: usize = 8;

/// Lock-free view of the client, replaced wholesale on every change.
#[derive(Debug, Clone, Default)]
pub struct ClientSnapshot {
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    pub status: ConnectionStatus,
    pub operator_online: bool,
    pub welcome_message: Option<String>,
    pub messages: Vec<Message>,
}

/// Everything the client reports to `on(...)` subscribers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    /// A message entered the list, from any transport.
    Message(Message),
    /// An optimistic send got its server ID.
    Confirmed { temp_id: String, id: String },
    SendFailed { temp_id: String, error: String },
    /// Typing, presence, receipts, edits, deletes, custom events, version
    /// warnings and config updates, as received.
    Server(ServerEvent),
}

impl ClientEvent {
    /// Subscription name: `status`, `message`, `confirmed`, `send_failed`, or
    /// the server event's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Status(_) => "status",
            ClientEvent::Message(_) => "message",
            ClientEvent::Confirmed { .. } => "confirmed",
            ClientEvent::SendFailed { .. } => "send_failed",
            ClientEvent::Server(event) => event.kind(),
        }
    }
}

struct Shared {
    snapshot: ArcSwap<ClientSnapshot>,
    events: Listeners<ClientEvent>,
    custom: Listeners<CustomEvent>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut ClientSnapshot)) {
        let mut next = (**self.snapshot.load()).clone();
        f(&mut next);
        self.snapshot.store(Arc::new(next));
    }

    fn emit(&self, event: ClientEvent) {
        self.events.emit(event.name(), &event);
    }
}

enum LoopCommand {
    PushOptimistic {
        content: String,
        reply_to: Option<String>,
        reply: oneshot::Sender<Message>,
    },
    ConfirmSend {
        temp_id: String,
        response: SendMessageResponse,
    },
    FailSend {
        temp_id: String,
        error: String,
    },
    /// Result of a local edit/delete/read, applied like a pushed event.
    ApplyLocal(ServerEvent),
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

struct Running {
    session_id: String,
    commands: mpsc::Sender<LoopCommand>,
    /// Resolves to the richest transport the session may still use.
    task: JoinHandle<Transport>,
}

impl Running {
    async fn stop(self) -> Option<Transport> {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(LoopCommand::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
        self.task.await.ok()
    }
}

/// Active loop plus the transport floor remembered across reconnects of
/// the same session.
#[derive(Default)]
struct Slot {
    active: Option<Running>,
    floor: Option<(String, Transport)>,
}

impl Slot {
    async fn stop(&mut self) -> Option<String> {
        let running = self.active.take()?;
        let session_id = running.session_id.clone();
        if let Some(floor) = running.stop().await {
            self.floor = Some((session_id.clone(), floor));
        }
        Some(session_id)
    }

    fn floor_for(&self, session_id: &str) -> Transport {
        match &self.floor {
            Some((id, floor)) if id == session_id => *floor,
            _ => Transport::WebSocket,
        }
    }
}

pub struct ChatClient {
    config: ClientConfig,
    api: Arc<dyn Api>,
    push: Arc<dyn PushTransport>,
    shared: Arc<Shared>,
    running: Mutex<Slot>,
}

impl ChatClient {
    /// Client talking to a real server at `config.base_url`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let api = HttpApi::new(config.base_url.clone())?;
        let push = RemoteTransport::new(config.base_url.clone());
        Ok(Self::with_transports(config, Arc::new(api), Arc::new(push)))
    }

    pub fn with_transports(
        config: ClientConfig,
        api: Arc<dyn Api>,
        push: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            config,
            api,
            push,
            shared: Arc::new(Shared {
                snapshot: ArcSwap::from_pointee(ClientSnapshot::default()),
                events: Listeners::new(),
                custom: Listeners::new(),
            }),
            running: Mutex::new(Slot::default()),
        }
    }

    /// Open (or resume) the visitor's session and start realtime updates.
    /// Reconnecting the same visitor resumes the previous session.
    pub async fn connect(
        &self,
        visitor_id: &str,
        metadata: Option<SessionMetadata>,
    ) -> Result<ConnectResponse> {
        let mut slot = self.running.lock().await;
        slot.stop().await;

        let snapshot = self.shared.snapshot.load_full();
        let resume = snapshot
            .session_id
            .clone()
            .filter(|_| snapshot.visitor_id.as_deref() == Some(visitor_id));
        let request = ConnectRequest {
            visitor_id: visitor_id.to_string(),
            session_id: resume,
            metadata,
            identity: None,
            widget_version: self.config.widget_version.clone(),
        };
        let response = self.api.connect(&request).await?;

        let mut reconciler = Reconciler::new(self.config.dedup_tolerance);
        reconciler.merge_poll(response.messages.clone());
        self.shared.update(|s| {
            s.session_id = Some(response.session_id.clone());
            s.visitor_id = Some(response.visitor_id.clone());
            s.operator_online = response.operator_online;
            s.welcome_message = response.welcome_message.clone();
            s.messages = reconciler.messages().to_vec();
            s.status = ConnectionStatus::Disconnected;
        });

        // Degradation is one-way for the life of a session; a new session
        // starts over from WebSocket.
        let floor = slot.floor_for(&response.session_id);
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let task = EventLoop::spawn(
            self.config.clone(),
            self.api.clone(),
            self.push.clone(),
            response.session_id.clone(),
            self.shared.clone(),
            reconciler,
            floor,
            command_rx,
        );
        slot.active = Some(Running {
            session_id: response.session_id.clone(),
            commands,
            task,
        });

        info!(
            component = "client",
            event = "client.connected",
            session_id = %response.session_id,
            visitor_id = %response.visitor_id,
            history = response.messages.len(),
            "Session connected"
        );
        Ok(response)
    }

    /// Tear down the active transport and every pending timer. Safe to call
    /// any number of times.
    pub async fn disconnect(&self) {
        if let Some(session_id) = self.running.lock().await.stop().await {
            info!(
                component = "client",
                event = "client.disconnected",
                session_id = %session_id,
                "Session disconnected"
            );
        }
    }

    /// Send a visitor message. It shows up immediately as a `temp-` entry and
    /// is promoted in place once the server confirms it.
    pub async fn send(&self, content: &str, reply_to: Option<&str>) -> Result<Message> {
        let (session_id, commands) = self.session().await?;

        let (reply, optimistic) = oneshot::channel();
        commands
            .send(LoopCommand::PushOptimistic {
                content: content.to_string(),
                reply_to: reply_to.map(str::to_string),
                reply,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        let temp = optimistic.await.map_err(|_| ClientError::NotConnected)?;

        let request = SendMessageRequest {
            session_id,
            content: content.to_string(),
            sender: Sender::Visitor,
            reply_to: reply_to.map(str::to_string),
        };
        match self.api.send(&request).await {
            Ok(response) => {
                let mut message = temp.clone();
                message.id = response.message_id.clone();
                message.timestamp = response.timestamp;
                message.status = MessageStatus::Sent;
                let _ = commands
                    .send(LoopCommand::ConfirmSend {
                        temp_id: temp.id,
                        response,
                    })
                    .await;
                Ok(message)
            }
            Err(e) => {
                let _ = commands
                    .send(LoopCommand::FailSend {
                        temp_id: temp.id,
                        error: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    pub async fn edit(&self, message_id: &str, content: &str) -> Result<EditMessageResponse> {
        let (session_id, commands) = self.session().await?;
        let response = self
            .api
            .edit(
                message_id,
                &EditMessageRequest {
                    session_id,
                    content: content.to_string(),
                },
            )
            .await?;
        let _ = commands
            .send(LoopCommand::ApplyLocal(ServerEvent::MessageEdited(
                MessageEditedData {
                    message_id: response.id.clone(),
                    content: response.content.clone(),
                    edited_at: response.edited_at,
                },
            )))
            .await;
        Ok(response)
    }

    pub async fn delete(&self, message_id: &str) -> Result<()> {
        let (session_id, commands) = self.session().await?;
        self.api.delete(&session_id, message_id).await?;
        let _ = commands
            .send(LoopCommand::ApplyLocal(ServerEvent::MessageDeleted(
                MessageDeletedData {
                    message_id: message_id.to_string(),
                    deleted_at: Utc::now(),
                },
            )))
            .await;
        Ok(())
    }

    /// Report operator messages as delivered or read. Returns how many the
    /// server updated.
    pub async fn mark_read(&self, message_ids: &[String], status: MessageStatus) -> Result<usize> {
        let (session_id, commands) = self.session().await?;
        let response = self
            .api
            .read(&ReadRequest {
                session_id: session_id.clone(),
                message_ids: message_ids.to_vec(),
                status: Some(status),
            })
            .await?;

        let now = Utc::now();
        let _ = commands
            .send(LoopCommand::ApplyLocal(ServerEvent::Read(ReadData {
                session_id,
                message_ids: message_ids.to_vec(),
                status,
                delivered_at: Some(now),
                read_at: (status == MessageStatus::Read).then_some(now),
            })))
            .await;
        Ok(response.updated)
    }

    pub async fn typing(&self, is_typing: bool) -> Result<()> {
        let (session_id, _) = self.session().await?;
        self.api
            .typing(&TypingRequest {
                session_id,
                sender: Sender::Visitor,
                is_typing,
            })
            .await
    }

    pub async fn identify(&self, identity: UserIdentity) -> Result<()> {
        let (session_id, _) = self.session().await?;
        self.api
            .identify(&IdentifyRequest {
                session_id,
                identity: Some(identity),
            })
            .await
    }

    /// Fire a custom event at the backend.
    pub async fn trigger(&self, name: &str, data: Map<String, Value>) -> Result<()> {
        let (session_id, _) = self.session().await?;
        self.api
            .event(&CustomEventRequest {
                session_id,
                name: name.to_string(),
                data,
            })
            .await
    }

    pub fn snapshot(&self) -> Arc<ClientSnapshot> {
        self.shared.snapshot.load_full()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.snapshot.load().messages.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.snapshot.load().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.snapshot.load().session_id.clone()
    }

    /// Subscribe to a [`ClientEvent`] by name, or `*` for all of them.
    pub fn on(
        &self,
        name: &str,
        callback: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.events.on(name, callback)
    }

    /// Subscribe to custom events pushed by the backend.
    pub fn on_event(
        &self,
        name: &str,
        callback: impl Fn(&CustomEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.custom.on(name, callback)
    }

    async fn session(&self) -> Result<(String, mpsc::Sender<LoopCommand>)> {
        let slot = self.running.lock().await;
        slot.active
            .as_ref()
            .map(|r| (r.session_id.clone(), r.commands.clone()))
            .ok_or(ClientError::NotConnected)
    }
}

// -- Event loop --

enum PushEvent {
    Opened {
        transport: Transport,
        attempt: u64,
    },
    Event {
        attempt: u64,
        event: ServerEvent,
    },
    Closed {
        transport: Transport,
        attempt: u64,
    },
    Failed {
        transport: Transport,
        attempt: u64,
        error: ClientError,
    },
}

#[derive(Debug, Clone, Copy)]
enum FetchKind {
    Poll,
    /// Gap fill after a WebSocket (re)opens.
    CatchUp,
}

struct Fetched {
    kind: FetchKind,
    result: Result<GetMessagesResponse>,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    ConnectTimeout(u64),
    Reconnect(u64),
}

struct EventLoop {
    config: ClientConfig,
    api: Arc<dyn Api>,
    push: Arc<dyn PushTransport>,
    session_id: String,
    shared: Arc<Shared>,
    negotiator: NegotiatorState,
    reconciler: Reconciler,
    poller: Poller,
    timer: Option<(Instant, Timer)>,
    next_poll: Option<Instant>,
    pump: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    catch_up: Option<JoinHandle<()>>,
    push_tx: mpsc::Sender<PushEvent>,
    fetch_tx: mpsc::Sender<Fetched>,
}

impl EventLoop {
    fn spawn(
        config: ClientConfig,
        api: Arc<dyn Api>,
        push: Arc<dyn PushTransport>,
        session_id: String,
        shared: Arc<Shared>,
        reconciler: Reconciler,
        floor: Transport,
        commands: mpsc::Receiver<LoopCommand>,
    ) -> JoinHandle<Transport> {
        let (push_tx, push_rx) = mpsc::channel(PUSH_BUFFER);
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_BUFFER);
        let poller = Poller::new(&config);
        let event_loop = EventLoop {
            config,
            api,
            push,
            session_id,
            shared,
            negotiator: NegotiatorState {
                floor,
                ..NegotiatorState::default()
            },
            reconciler,
            poller,
            timer: None,
            next_poll: None,
            pump: None,
            poll_task: None,
            catch_up: None,
            push_tx,
            fetch_tx,
        };
        tokio::spawn(event_loop.run(commands, push_rx, fetch_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LoopCommand>,
        mut push_rx: mpsc::Receiver<PushEvent>,
        mut fetch_rx: mpsc::Receiver<Fetched>,
    ) -> Transport {
        self.step(Input::Start);

        loop {
            let timer_at = self.timer.map(|(at, _)| at);
            let poll_at = self.next_poll.filter(|_| self.poll_task.is_none());

            tokio::select! {
                command = commands.recv() => match command {
                    Some(LoopCommand::Disconnect { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return self.negotiator.floor;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        // Client dropped.
                        self.shutdown();
                        return self.negotiator.floor;
                    }
                },
                Some(event) = push_rx.recv() => self.handle_push(event),
                Some(fetched) = fetch_rx.recv() => self.handle_fetch(fetched),
                _ = sleep_until(timer_at.unwrap_or_else(far_future)), if timer_at.is_some() => {
                    self.fire_timer();
                }
                _ = sleep_until(poll_at.unwrap_or_else(far_future)), if poll_at.is_some() => {
                    self.start_poll();
                }
            }
        }
    }

    fn step(&mut self, input: Input) {
        let now = Instant::now().into_std();
        let state = std::mem::take(&mut self.negotiator);
        let (state, effects) = negotiator::transition(state, input, now, &self.config);
        self.negotiator = state;
        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Open { transport, attempt } => self.open(transport, attempt),
            Effect::Close(transport) => {
                if let Some(pump) = self.pump.take() {
                    pump.abort();
                }
                debug!(
                    component = "client",
                    event = "client.transport.closed",
                    session_id = %self.session_id,
                    transport = transport.as_str(),
                    "Transport abandoned"
                );
            }
            Effect::ArmConnectTimeout { attempt, after } => {
                self.timer = Some((Instant::now() + after, Timer::ConnectTimeout(attempt)));
            }
            Effect::ScheduleReconnect { attempt, delay } => {
                debug!(
                    component = "client",
                    event = "client.transport.reconnect_scheduled",
                    session_id = %self.session_id,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect scheduled"
                );
                self.timer = Some((Instant::now() + delay, Timer::Reconnect(attempt)));
            }
            Effect::CancelTimers => self.timer = None,
            Effect::StartPolling => {
                self.poller = Poller::new(&self.config);
                self.next_poll = Some(Instant::now());
            }
            Effect::StopPolling => {
                self.next_poll = None;
                if let Some(task) = self.poll_task.take() {
                    task.abort();
                }
            }
            Effect::Emit(status) => {
                info!(
                    component = "client",
                    event = "client.status",
                    session_id = %self.session_id,
                    status = ?status,
                    "Connection status changed"
                );
                self.shared.update(|s| s.status = status);
                self.shared.emit(ClientEvent::Status(status));
            }
        }
    }

    fn open(&mut self, transport: Transport, attempt: u64) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let push = self.push.clone();
        let tx = self.push_tx.clone();
        let session_id = self.session_id.clone();
        let cursor = self.reconciler.cursor().map(str::to_string);

        self.pump = Some(tokio::spawn(async move {
            let mut stream = match push.open(transport, &session_id, cursor.as_deref()).await {
                Ok(stream) => stream,
                Err(error) => {
                    let _ = tx
                        .send(PushEvent::Failed {
                            transport,
                            attempt,
                            error,
                        })
                        .await;
                    return;
                }
            };
            if tx
                .send(PushEvent::Opened { transport, attempt })
                .await
                .is_err()
            {
                return;
            }
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        if tx.send(PushEvent::Event { attempt, event }).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = tx
                            .send(PushEvent::Failed {
                                transport,
                                attempt,
                                error,
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = tx.send(PushEvent::Closed { transport, attempt }).await;
        }));
    }

    fn shutdown(&mut self) {
        self.step(Input::Disconnect);
        for task in [
            self.pump.take(),
            self.poll_task.take(),
            self.catch_up.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.timer = None;
        self.next_poll = None;
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::PushOptimistic {
                content,
                reply_to,
                reply,
            } => {
                let message = self.reconciler.push_optimistic(
                    &self.session_id,
                    &content,
                    reply_to.as_deref(),
                    Utc::now(),
                );
                self.publish_messages();
                let _ = reply.send(message);
            }
            LoopCommand::ConfirmSend { temp_id, response } => {
                let applied = self.reconciler.confirm_send(&temp_id, &response);
                self.publish_messages();
                self.announce(applied);
            }
            LoopCommand::FailSend { temp_id, error } => {
                warn!(
                    component = "client",
                    event = "client.send_failed",
                    session_id = %self.session_id,
                    temp_id = %temp_id,
                    error = %error,
                    "Send failed, dropping optimistic message"
                );
                if self.reconciler.fail_send(&temp_id).is_some() {
                    self.publish_messages();
                }
                self.shared.emit(ClientEvent::SendFailed { temp_id, error });
            }
            LoopCommand::ApplyLocal(event) => self.apply_event(event),
            LoopCommand::Disconnect { .. } => {}
        }
    }

    fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Opened { transport, attempt } => {
                self.step(Input::Opened { transport, attempt });
                let live = self.negotiator.push_transport() == Some((transport, attempt));
                if live && transport == Transport::WebSocket && self.reconciler.cursor().is_some() {
                    self.fill_gap();
                }
            }
            PushEvent::Event { attempt, event } => {
                if self.negotiator.push_transport().map(|(_, a)| a) != Some(attempt) {
                    return;
                }
                self.apply_event(event);
            }
            PushEvent::Closed { transport, attempt } => {
                self.step(Input::Closed { transport, attempt });
            }
            PushEvent::Failed {
                transport,
                attempt,
                error,
            } => {
                warn!(
                    component = "client",
                    event = "client.transport.failed",
                    session_id = %self.session_id,
                    transport = transport.as_str(),
                    error = %error,
                    "Transport failed"
                );
                self.step(Input::Failed { transport, attempt });
            }
        }
    }

    fn handle_fetch(&mut self, fetched: Fetched) {
        match fetched.kind {
            FetchKind::CatchUp => {
                self.catch_up = None;
                match fetched.result {
                    Ok(page) => self.merge_page(page.messages),
                    Err(e) => debug!(
                        component = "client",
                        event = "client.catch_up_failed",
                        session_id = %self.session_id,
                        error = %e,
                        "Catch-up fetch failed"
                    ),
                }
            }
            FetchKind::Poll => {
                self.poll_task = None;
                if self.negotiator.phase != Phase::Polling {
                    return;
                }
                match fetched.result {
                    Ok(page) => {
                        let has_more = page.has_more;
                        self.merge_page(page.messages);
                        let delay = self.poller.on_success();
                        let wait = if has_more { Duration::ZERO } else { delay };
                        self.next_poll = Some(Instant::now() + wait);
                    }
                    Err(e) => match self.poller.on_failure() {
                        PollDecision::Retry(delay) => {
                            warn!(
                                component = "client",
                                event = "client.poll_failed",
                                session_id = %self.session_id,
                                failures = self.poller.failures(),
                                retry_ms = delay.as_millis() as u64,
                                error = %e,
                                "Poll failed, backing off"
                            );
                            self.next_poll = Some(Instant::now() + delay);
                        }
                        PollDecision::Exhausted => {
                            error!(
                                component = "client",
                                event = "client.poll_exhausted",
                                session_id = %self.session_id,
                                failures = self.poller.failures(),
                                error = %e,
                                "Polling gave up, realtime updates unavailable"
                            );
                            self.step(Input::PollingExhausted);
                        }
                    },
                }
            }
        }
    }

    fn fire_timer(&mut self) {
        let Some((_, timer)) = self.timer.take() else {
            return;
        };
        let input = match timer {
            Timer::ConnectTimeout(attempt) => {
                warn!(
                    component = "client",
                    event = "client.transport.connect_timeout",
                    session_id = %self.session_id,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Transport did not open in time"
                );
                Input::ConnectTimeout { attempt }
            }
            Timer::Reconnect(attempt) => Input::ReconnectDue { attempt },
        };
        self.step(input);
    }

    fn start_poll(&mut self) {
        self.next_poll = None;
        self.poll_task = Some(self.fetch(FetchKind::Poll));
    }

    fn fill_gap(&mut self) {
        if let Some(task) = self.catch_up.take() {
            task.abort();
        }
        self.catch_up = Some(self.fetch(FetchKind::CatchUp));
    }

    fn fetch(&self, kind: FetchKind) -> JoinHandle<()> {
        let api = self.api.clone();
        let tx = self.fetch_tx.clone();
        let query = GetMessagesQuery {
            session_id: self.session_id.clone(),
            after: self.reconciler.cursor().map(str::to_string),
            limit: None,
        };
        tokio::spawn(async move {
            let result = api.fetch_messages(&query).await;
            let _ = tx.send(Fetched { kind, result }).await;
        })
    }

    fn apply_event(&mut self, event: ServerEvent) {
        let applied = self.reconciler.apply(&event);
        self.publish_messages();
        match event {
            ServerEvent::Message(_) => self.announce(applied),
            ServerEvent::Presence(ref presence) => {
                let online = presence.online;
                self.shared.update(|s| s.operator_online = online);
                self.shared.emit(ClientEvent::Server(event));
            }
            ServerEvent::Event(ref custom) => {
                self.shared.custom.emit(&custom.name, custom);
                self.shared.emit(ClientEvent::Server(event));
            }
            other => self.shared.emit(ClientEvent::Server(other)),
        }
    }

    fn merge_page(&mut self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let applied = self.reconciler.merge_poll(messages);
        self.publish_messages();
        for applied in applied {
            self.announce(applied);
        }
    }

    fn announce(&self, applied: Applied) {
        match applied {
            Applied::Inserted { id } => {
                if let Some(message) = self.reconciler.messages().iter().find(|m| m.id == id) {
                    self.shared.emit(ClientEvent::Message(message.clone()));
                }
            }
            Applied::Promoted { temp_id, id } => {
                self.shared.emit(ClientEvent::Confirmed { temp_id, id });
            }
            _ => {}
        }
    }

    fn publish_messages(&self) {
        let messages = self.reconciler.messages().to_vec();
        self.shared.update(|s| s.messages = messages);
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use futures::stream;

    use super::*;
    use crate::transport::EventStream;

    #[derive(Default)]
    struct FakeApi {
        sent: StdMutex<Vec<SendMessageRequest>>,
        fail_sends: AtomicBool,
        fail_fetches: AtomicBool,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl Api for FakeApi {
        async fn connect(&self, request: &ConnectRequest) -> Result<ConnectResponse> {
            Ok(ConnectResponse {
                session_id: request.session_id.clone().unwrap_or_else(|| "s-1".into()),
                visitor_id: request.visitor_id.clone(),
                operator_online: true,
                welcome_message: Some("Hi! How can we help?".into()),
                messages: Vec::new(),
            })
        }

        async fn send(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ClientError::Api {
                    status: 500,
                    code: "storage_error".into(),
                    message: "internal storage error".into(),
                });
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(request.clone());
            Ok(SendMessageResponse {
                message_id: format!("m-{}", sent.len()),
                timestamp: Utc::now(),
            })
        }

        async fn fetch_messages(&self, _query: &GetMessagesQuery) -> Result<GetMessagesResponse> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetches.load(Ordering::SeqCst) {
                return Err(ClientError::Timeout);
            }
            Ok(GetMessagesResponse {
                messages: Vec::new(),
                has_more: false,
            })
        }

        async fn edit(
            &self,
            message_id: &str,
            request: &EditMessageRequest,
        ) -> Result<EditMessageResponse> {
            Ok(EditMessageResponse {
                id: message_id.to_string(),
                content: request.content.clone(),
                edited_at: Utc::now(),
            })
        }

        async fn delete(&self, _session_id: &str, _message_id: &str) -> Result<DeleteMessageResponse> {
            Ok(DeleteMessageResponse { deleted: true })
        }

        async fn read(&self, request: &ReadRequest) -> Result<ReadResponse> {
            Ok(ReadResponse {
                updated: request.message_ids.len(),
            })
        }

        async fn typing(&self, _request: &TypingRequest) -> Result<()> {
            Ok(())
        }

        async fn identify(&self, _request: &IdentifyRequest) -> Result<()> {
            Ok(())
        }

        async fn event(&self, _request: &CustomEventRequest) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        /// Handshake never completes.
        Hang,
        Refuse,
        /// Opens and yields whatever the test feeds it.
        Stream,
    }

    struct FakePush {
        ws: Behavior,
        sse: Behavior,
        opened: StdMutex<Vec<Transport>>,
        feed: StdMutex<Option<fmpsc::UnboundedReceiver<Result<ServerEvent>>>>,
    }

    impl FakePush {
        fn new(ws: Behavior, sse: Behavior) -> (Self, fmpsc::UnboundedSender<Result<ServerEvent>>) {
            let (tx, rx) = fmpsc::unbounded();
            let push = Self {
                ws,
                sse,
                opened: StdMutex::new(Vec::new()),
                feed: StdMutex::new(Some(rx)),
            };
            (push, tx)
        }

        fn opened(&self) -> Vec<Transport> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushTransport for FakePush {
        async fn open(
            &self,
            transport: Transport,
            _session_id: &str,
            _cursor: Option<&str>,
        ) -> Result<EventStream> {
            self.opened.lock().unwrap().push(transport);
            let behavior = match transport {
                Transport::WebSocket => self.ws,
                Transport::Sse => self.sse,
                Transport::Polling => Behavior::Refuse,
            };
            match behavior {
                Behavior::Hang => futures::future::pending::<Result<EventStream>>().await,
                Behavior::Refuse => Err(ClientError::Transport("connection refused".into())),
                Behavior::Stream => match self.feed.lock().unwrap().take() {
                    Some(rx) => Ok(rx.boxed()),
                    None => Ok(stream::pending().boxed()),
                },
            }
        }
    }

    struct Harness {
        client: ChatClient,
        api: Arc<FakeApi>,
        push: Arc<FakePush>,
        feed: fmpsc::UnboundedSender<Result<ServerEvent>>,
    }

    fn harness(ws: Behavior, sse: Behavior) -> Harness {
        let api = Arc::new(FakeApi::default());
        let (push, feed) = FakePush::new(ws, sse);
        let push = Arc::new(push);
        let client = ChatClient::with_transports(ClientConfig::default(), api.clone(), push.clone());
        Harness {
            client,
            api,
            push,
            feed,
        }
    }

    async fn wait_until(client: &ChatClient, what: impl Fn(&ClientSnapshot) -> bool) {
        for _ in 0..20_000 {
            if what(&client.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition never met: {:?}", client.snapshot());
    }

    fn operator_message(id: &str, content: &str) -> ServerEvent {
        ServerEvent::Message(Message::new(
            id.into(),
            "s-1".into(),
            Sender::Operator,
            content.into(),
            Utc::now(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn ws_hang_then_sse_error_settles_on_polling() {
        let h = harness(Behavior::Hang, Behavior::Refuse);
        let started = Instant::now();
        h.client.connect("v1", None).await.unwrap();

        wait_until(&h.client, |s| {
            s.status == ConnectionStatus::Connected(Transport::Polling)
        })
        .await;
        assert!(started.elapsed() >= Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.push.opened(), vec![Transport::WebSocket, Transport::Sse]);
        assert_eq!(
            h.client.status(),
            ConnectionStatus::Connected(Transport::Polling)
        );
        assert!(h.api.fetches.load(Ordering::SeqCst) > 1);

        h.client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_session_keeps_polling_without_retrying_push() {
        let h = harness(Behavior::Hang, Behavior::Refuse);
        h.client.connect("v1", None).await.unwrap();
        wait_until(&h.client, |s| {
            s.status == ConnectionStatus::Connected(Transport::Polling)
        })
        .await;
        h.client.disconnect().await;

        let resumed = h.client.connect("v1", None).await.unwrap();
        assert_eq!(resumed.session_id, "s-1");
        wait_until(&h.client, |s| {
            s.status == ConnectionStatus::Connected(Transport::Polling)
        })
        .await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.push.opened(), vec![Transport::WebSocket, Transport::Sse]);
        h.client.disconnect().await;
    }

    #[test]
    fn remembered_floor_only_applies_to_its_session() {
        let slot = Slot {
            active: None,
            floor: Some(("s-1".into(), Transport::Polling)),
        };
        assert_eq!(slot.floor_for("s-1"), Transport::Polling);
        assert_eq!(slot.floor_for("s-2"), Transport::WebSocket);
        assert_eq!(Slot::default().floor_for("s-1"), Transport::WebSocket);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_messages_are_listed_once() {
        let h = harness(Behavior::Stream, Behavior::Stream);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.client.on("message", move |event| {
            if let ClientEvent::Message(m) = event {
                sink.lock().unwrap().push(m.content.clone());
            }
        });

        h.client.connect("v1", None).await.unwrap();
        wait_until(&h.client, |s| {
            s.status == ConnectionStatus::Connected(Transport::WebSocket)
        })
        .await;

        let event = operator_message("m-9", "Hi there");
        h.feed.unbounded_send(Ok(event.clone())).unwrap();
        h.feed.unbounded_send(Ok(event)).unwrap();
        wait_until(&h.client, |s| !s.messages.is_empty()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.client.messages().len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["Hi there".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_send_is_promoted_not_duplicated() {
        let h = harness(Behavior::Stream, Behavior::Stream);
        h.client.connect("v1", None).await.unwrap();

        let sent = h.client.send("hi", None).await.unwrap();
        assert_eq!(sent.id, "m-1");
        wait_until(&h.client, |s| {
            s.messages.len() == 1 && s.messages[0].id == "m-1"
        })
        .await;
        assert_eq!(h.client.messages()[0].status, MessageStatus::Sent);

        let mut echo = sent.clone();
        echo.status = MessageStatus::Delivered;
        wait_until(&h.client, |s| {
            s.status == ConnectionStatus::Connected(Transport::WebSocket)
        })
        .await;
        h.feed.unbounded_send(Ok(ServerEvent::Message(echo))).unwrap();
        wait_until(&h.client, |s| {
            s.messages[0].status == MessageStatus::Delivered
        })
        .await;
        assert_eq!(h.client.messages().len(), 1);
        assert_eq!(h.api.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_removes_the_optimistic_entry() {
        let h = harness(Behavior::Stream, Behavior::Stream);
        h.api.fail_sends.store(true, Ordering::SeqCst);
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let _sub = h.client.on("send_failed", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        h.client.connect("v1", None).await.unwrap();

        let err = h.client.send("hello?", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 500, .. }));
        wait_until(&h.client, |s| s.messages.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_stops_reconnecting() {
        let h = harness(Behavior::Stream, Behavior::Stream);
        h.client.connect("v1", None).await.unwrap();
        wait_until(&h.client, |s| {
            s.status == ConnectionStatus::Connected(Transport::WebSocket)
        })
        .await;

        h.client.disconnect().await;
        h.client.disconnect().await;
        assert_eq!(h.client.status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.push.opened(), vec![Transport::WebSocket]);
        assert!(matches!(
            h.client.send("late", None).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_after_repeated_failures() {
        let h = harness(Behavior::Refuse, Behavior::Refuse);
        h.api.fail_fetches.store(true, Ordering::SeqCst);
        h.client.connect("v1", None).await.unwrap();

        wait_until(&h.client, |s| s.status == ConnectionStatus::Unavailable).await;
        let fetches = h.api.fetches.load(Ordering::SeqCst);
        assert_eq!(fetches, ClientConfig::default().max_poll_failures as usize);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.api.fetches.load(Ordering::SeqCst), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_events_and_presence_reach_subscribers() {
        let h = harness(Behavior::Stream, Behavior::Stream);
        let promos = Arc::new(AtomicUsize::new(0));
        let counter = promos.clone();
        let _sub = h.client.on_event("promo_shown", move |event| {
            assert_eq!(event.data.get("code"), Some(&Value::from("SPRING")));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        h.client.connect("v1", None).await.unwrap();
        assert!(h.client.snapshot().operator_online);
        wait_until(&h.client, |s| {
            s.status == ConnectionStatus::Connected(Transport::WebSocket)
        })
        .await;

        let mut data = Map::new();
        data.insert("code".into(), Value::from("SPRING"));
        h.feed
            .unbounded_send(Ok(ServerEvent::Event(CustomEvent {
                name: "promo_shown".into(),
                data,
                timestamp: Utc::now(),
                session_id: Some("s-1".into()),
            })))
            .unwrap();
        h.feed
            .unbounded_send(Ok(ServerEvent::Presence(
                pocketping_protocol::server::PresenceData { online: false },
            )))
            .unwrap();

        wait_until(&h.client, |s| !s.operator_online).await;
        assert_eq!(promos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_and_delete_update_the_list_in_place() {
        let h = harness(Behavior::Stream, Behavior::Stream);
        h.client.connect("v1", None).await.unwrap();
        h.client.send("helo", None).await.unwrap();

        h.client.edit("m-1", "hello").await.unwrap();
        wait_until(&h.client, |s| {
            s.messages.first().map(|m| m.content.as_str()) == Some("hello")
        })
        .await;

        h.client.delete("m-1").await.unwrap();
        wait_until(&h.client, |s| {
            s.messages.first().is_some_and(|m| m.is_deleted())
        })
        .await;
        assert_eq!(h.client.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_same_visitor_resumes_session() {
        let h = harness(Behavior::Stream, Behavior::Stream);
        let first = h.client.connect("v1", None).await.unwrap();
        let second = h.client.connect("v1", None).await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(h.client.session_id().as_deref(), Some("s-1"));
        h.client.disconnect().await;
    }
}
