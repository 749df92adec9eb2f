//! Server-sent events push channel.
//!
//! `GET /api/stream?sessionId=..&after=..` replays stored messages after the
//! cursor, then streams live events. Each `data:` line is one `ServerEvent`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream, StreamExt};
use pocketping_core::{ChatService, Error};
use pocketping_protocol::ServerEvent;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::http::ApiError;
use crate::state::AppState;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub session_id: String,
    #[serde(default)]
    pub after: Option<String>,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let events = session_events(&state.service, &query.session_id, query.after.as_deref()).await?;
    let stream = events.map(|event| Event::default().event(event.kind()).json_data(&event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

/// Backlog after `after` followed by live events for the session.
///
/// The connection is registered before the backlog is read, so a message
/// written in between may show up twice; clients dedup by ID.
pub(crate) async fn session_events(
    service: &ChatService,
    session_id: &str,
    after: Option<&str>,
) -> Result<impl Stream<Item = ServerEvent> + Send + 'static, ApiError> {
    if service.session(session_id).await?.is_none() {
        return Err(Error::SessionNotFound(session_id.to_string()).into());
    }

    let (registration, rx) = service.gateway().register(session_id);
    let backlog = match after.filter(|a| !a.is_empty()) {
        Some(after) => {
            service
                .store()
                .get_messages(session_id, Some(after), usize::MAX)
                .await?
        }
        None => Vec::new(),
    };

    info!(
        component = "sse",
        event = "sse.connection.opened",
        connection_id = registration.id(),
        session_id = %session_id,
        replayed = backlog.len(),
        "SSE stream opened"
    );

    let replay = stream::iter(backlog.into_iter().map(ServerEvent::Message));
    let live = ReceiverStream::new(rx).map(move |event| {
        // The registration lives as long as the stream.
        let _connection = &registration;
        event
    });
    Ok(replay.chain(live))
}
