//! Optional auth token middleware.
//!
//! When `--auth-token` is configured, the operator routes (`/api/operator/*`)
//! must include `Authorization: Bearer <token>`. Widget endpoints and
//! `/health` stay public; the layer is only attached to the operator router.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

pub async fn auth_middleware(
    State(expected_token): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if is_authorized(req.headers(), &expected_token) {
        return Ok(next.run(req).await);
    }

    warn!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
        "Operator request without a valid token"
    );
    Err(StatusCode::UNAUTHORIZED)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub(crate) fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    bearer_token(headers).is_some_and(|token| !token.is_empty() && token == expected)
}
