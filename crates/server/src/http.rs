//! REST endpoints for widgets and operator bridges.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header::USER_AGENT, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use pocketping_core::Error;
use pocketping_protocol::client::{
    ConnectRequest, CustomEventRequest, DeleteMessageQuery, DeleteMessageResponse,
    EditMessageRequest, EditMessageResponse, GetMessagesQuery, GetMessagesResponse,
    IdentifyRequest, OkResponse, OperatorDeleteRequest, OperatorEditRequest,
    OperatorMessageRequest, OperatorStatusRequest, PresenceResponse, ReadRequest, ReadResponse,
    SendMessageRequest, SendMessageResponse, TypingRequest,
};
use pocketping_protocol::{Message, Sender};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::auth_middleware;
use crate::sse::stream_handler;
use crate::state::AppState;
use crate::websocket::ws_handler;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let ApiError::Core(err) = self;
        match err {
            Error::SessionNotFound(_) | Error::MessageNotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) | Error::Rejected(_) => StatusCode::FORBIDDEN,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let ApiError::Core(err) = &self;
        let message = if let Error::Storage(e) = err {
            error!(
                component = "http",
                event = "http.storage_error",
                error = %e,
                "Storage failure while handling request"
            );
            "internal storage error".to_string()
        } else {
            err.to_string()
        };
        let body = ErrorBody {
            error: err.code(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: Arc<AppState>, auth_token: Option<String>) -> Router {
    let mut operator = Router::new()
        .route(
            "/api/operator/message",
            post(operator_message)
                .patch(operator_edit)
                .delete(operator_delete),
        )
        .route("/api/operator/status", post(operator_status));
    if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
        operator = operator.route_layer(middleware::from_fn_with_state(
            Arc::<str>::from(token),
            auth_middleware,
        ));
    }

    Router::new()
        .route("/health", get(health))
        .route("/api/connect", post(connect))
        .route("/api/message", post(send_message))
        .route(
            "/api/message/{id}",
            patch(edit_message).delete(delete_message),
        )
        .route("/api/messages", get(get_messages))
        .route("/api/read", post(mark_read))
        .route("/api/typing", post(typing))
        .route("/api/identify", post(identify))
        .route("/api/event", post(custom_event))
        .route("/api/presence", get(presence))
        .route("/api/stream", get(stream_handler))
        .route("/ws", get(ws_handler))
        .merge(operator)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "bridges": state.service.bridge_names(),
        "runId": state.run_id,
    }))
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the socket peer.
pub(crate) fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };
    forwarded.or_else(real_ip).unwrap_or_else(|| peer.ip())
}

async fn connect(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ConnectRequest>,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, peer).to_string();
    if let Some(user_agent) = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        state.service.check_user_agent(user_agent)?;
    }
    let outcome = state.service.connect(request, Some(&ip)).await?;

    let mut response = Json(outcome.response).into_response();
    for (name, value) in outcome.version.headers() {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(&value)) {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    // Operator and AI replies go through the token-guarded operator routes.
    if request.sender != Sender::Visitor {
        return Err(Error::Unauthorized(format!(
            "widget cannot send as {:?}",
            request.sender
        ))
        .into());
    }
    let message = state
        .service
        .send_message(
            &request.session_id,
            &request.content,
            Sender::Visitor,
            request.reply_to.as_deref(),
        )
        .await?;
    Ok(Json(SendMessageResponse {
        message_id: message.id,
        timestamp: message.timestamp,
    }))
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GetMessagesQuery>,
) -> ApiResult<GetMessagesResponse> {
    Ok(Json(state.service.list_messages(&query).await?))
}

fn edited(message: Message) -> EditMessageResponse {
    EditMessageResponse {
        edited_at: message.edited_at.unwrap_or_else(Utc::now),
        id: message.id,
        content: message.content,
    }
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Json(request): Json<EditMessageRequest>,
) -> ApiResult<EditMessageResponse> {
    let message = state
        .service
        .edit_message(&request.session_id, &message_id, &request.content)
        .await?;
    Ok(Json(edited(message)))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Query(query): Query<DeleteMessageQuery>,
) -> ApiResult<DeleteMessageResponse> {
    state
        .service
        .delete_message(&query.session_id, &message_id)
        .await?;
    Ok(Json(DeleteMessageResponse { deleted: true }))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReadRequest>,
) -> ApiResult<ReadResponse> {
    let updated = state.service.mark_read(&request).await?;
    Ok(Json(ReadResponse { updated }))
}

async fn typing(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TypingRequest>,
) -> ApiResult<OkResponse> {
    state
        .service
        .typing(&request.session_id, request.sender, request.is_typing)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn identify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdentifyRequest>,
) -> ApiResult<OkResponse> {
    state
        .service
        .identify(&request.session_id, request.identity)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn custom_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomEventRequest>,
) -> ApiResult<OkResponse> {
    state
        .service
        .handle_custom_event(&request.session_id, &request.name, request.data)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn presence(State(state): State<Arc<AppState>>) -> Json<PresenceResponse> {
    Json(state.service.presence())
}

// -- Operator routes --

async fn operator_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OperatorMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    let message = state.service.record_operator_message(&request).await?;
    Ok(Json(SendMessageResponse {
        message_id: message.id,
        timestamp: message.timestamp,
    }))
}

async fn operator_edit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OperatorEditRequest>,
) -> ApiResult<EditMessageResponse> {
    let message = state.service.record_operator_edit(&request).await?;
    Ok(Json(edited(message)))
}

async fn operator_delete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OperatorDeleteRequest>,
) -> ApiResult<DeleteMessageResponse> {
    state.service.record_operator_delete(&request).await?;
    Ok(Json(DeleteMessageResponse { deleted: true }))
}

async fn operator_status(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OperatorStatusRequest>,
) -> Json<PresenceResponse> {
    state.service.set_operator_online(request.online);
    Json(state.service.presence())
}

#[cfg(test)]
pub(crate) mod tests {
    use pocketping_core::{ChatService, MemoryStore, ServiceConfig};

    use super::*;

    pub(crate) fn test_state() -> Arc<AppState> {
        let service = ChatService::new(ServiceConfig::default(), Arc::new(MemoryStore::new()));
        AppState::new(Arc::new(service), "test-run")
    }

    pub(crate) async fn open_session(state: &Arc<AppState>) -> String {
        state
            .service
            .connect(
                ConnectRequest {
                    visitor_id: "v1".into(),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap()
            .response
            .session_id
    }

    fn peer() -> SocketAddr {
        "192.0.2.10:55000".parse().unwrap()
    }

    #[test]
    fn error_codes_map_to_http_statuses() {
        let cases = [
            (Error::SessionNotFound("s".into()), StatusCode::NOT_FOUND),
            (Error::MessageNotFound("m".into()), StatusCode::NOT_FOUND),
            (Error::Unauthorized("u".into()), StatusCode::FORBIDDEN),
            (Error::InvalidState("i".into()), StatusCode::CONFLICT),
            (Error::Validation("v".into()), StatusCode::BAD_REQUEST),
            (Error::Rejected("r".into()), StatusCode::FORBIDDEN),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn client_ip_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer()).to_string(), "192.0.2.10");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_ip(&headers, peer()).to_string(), "198.51.100.4");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer()).to_string(), "203.0.113.7");
    }

    #[tokio::test]
    async fn connect_sets_version_headers() {
        let service = ChatService::new(
            ServiceConfig {
                latest_widget_version: Some("1.2.0".into()),
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
        );
        let state = AppState::new(Arc::new(service), "test-run");

        let response = connect(
            State(state),
            ConnectInfo(peer()),
            HeaderMap::new(),
            Json(ConnectRequest {
                visitor_id: "v1".into(),
                widget_version: Some("1.1.0".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-pocketping-version-status").unwrap(),
            "outdated"
        );
    }

    #[tokio::test]
    async fn connect_rejects_blocked_user_agent_header() {
        let service = ChatService::new(
            ServiceConfig {
                ua_filter: pocketping_core::UaFilter {
                    enabled: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
        );
        let state = AppState::new(Arc::new(service), "test-run");
        let request = || ConnectRequest {
            visitor_id: "v1".into(),
            ..Default::default()
        };

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("python-requests/2.31"));
        let err = connect(
            State(state.clone()),
            ConnectInfo(peer()),
            headers,
            Json(request()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (X11; Linux x86_64) Firefox/126.0"),
        );
        let response = connect(State(state), ConnectInfo(peer()), headers, Json(request()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn send_edit_delete_through_handlers() {
        let state = test_state();
        let session_id = open_session(&state).await;

        let Json(sent) = send_message(
            State(state.clone()),
            Json(SendMessageRequest {
                session_id: session_id.clone(),
                content: "Hello".into(),
                sender: Sender::Visitor,
                reply_to: None,
            }),
        )
        .await
        .unwrap();

        let Json(edit) = edit_message(
            State(state.clone()),
            Path(sent.message_id.clone()),
            Json(EditMessageRequest {
                session_id: session_id.clone(),
                content: "Hello!".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(edit.id, sent.message_id);
        assert_eq!(edit.content, "Hello!");

        let Json(deleted) = delete_message(
            State(state.clone()),
            Path(sent.message_id.clone()),
            Query(DeleteMessageQuery {
                session_id: session_id.clone(),
            }),
        )
        .await
        .unwrap();
        assert!(deleted.deleted);

        let err = edit_message(
            State(state.clone()),
            Path(sent.message_id.clone()),
            Json(EditMessageRequest {
                session_id,
                content: "back".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn widget_cannot_post_as_operator() {
        let state = test_state();
        let session_id = open_session(&state).await;

        for sender in [Sender::Operator, Sender::Ai] {
            let err = send_message(
                State(state.clone()),
                Json(SendMessageRequest {
                    session_id: session_id.clone(),
                    content: "I am support".into(),
                    sender,
                    reply_to: None,
                }),
            )
            .await
            .unwrap_err();
            assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
        }

        let Json(page) = get_messages(
            State(state),
            Query(GetMessagesQuery {
                session_id,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let state = test_state();
        let err = get_messages(
            State(state),
            Query(GetMessagesQuery {
                session_id: "nope".into(),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn operator_status_flips_presence() {
        let state = test_state();
        let Json(presence) = operator_status(
            State(state.clone()),
            Json(OperatorStatusRequest { online: true }),
        )
        .await;
        assert!(presence.online);
        assert!(state.service.presence().online);
    }
}
