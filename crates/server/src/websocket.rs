//! WebSocket handling
//!
//! `GET /ws?sessionId=..` upgrades to a socket that receives every
//! `ServerEvent` for the session. The widget may send `typing`, `event`
//! and `ping` frames back.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use pocketping_core::Error;
use pocketping_protocol::{ClientMessage, Sender};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::http::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub session_id: String,
}

/// WebSocket upgrade handler. Unknown sessions are refused before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Result<Response, ApiError> {
    if state.service.session(&query.session_id).await?.is_none() {
        return Err(Error::SessionNotFound(query.session_id).into());
    }
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, query.session_id))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (registration, mut events) = state.service.gateway().register(&session_id);
    let connection_id = registration.id();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id,
        session_id = %session_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Forward gateway events to the socket. Ends when the gateway drops us.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(
                        component = "websocket",
                        event = "ws.send.serialize_failed",
                        connection_id,
                        error = %e,
                        "Failed to serialize server event"
                    );
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &session_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(
                        component = "websocket",
                        event = "ws.receive.failed",
                        connection_id,
                        error = %e,
                        "WebSocket receive failed"
                    );
                    break;
                }
            },
        }
    }

    send_task.abort();
    drop(registration);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id,
        session_id = %session_id,
        "WebSocket connection closed"
    );
}

/// Handle one text frame from the widget. Bad frames are logged and ignored.
pub(crate) async fn handle_client_message(state: &AppState, session_id: &str, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.message.invalid",
                session_id = %session_id,
                error = %e,
                "Ignoring malformed client frame"
            );
            return;
        }
    };

    let result = match message {
        ClientMessage::Typing { is_typing } => {
            state
                .service
                .typing(session_id, Sender::Visitor, is_typing)
                .await
        }
        ClientMessage::Event(event) => {
            state
                .service
                .handle_custom_event(session_id, &event.name, event.data)
                .await
        }
        ClientMessage::Ping => Ok(()),
    };

    if let Err(e) = result {
        warn!(
            component = "websocket",
            event = "ws.message.failed",
            session_id = %session_id,
            error = %e,
            "Client frame rejected"
        );
    }
}
