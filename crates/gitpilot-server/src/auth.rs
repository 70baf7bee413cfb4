use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};

/// Who may reach the API.
///
/// Requests whose `Host` is loopback always pass. Any other host needs the
/// shared token, sent as `Authorization: Bearer TOKEN` or, for EventSource
/// and WebSocket clients that cannot set headers, as `?token=TOKEN`. Without
/// a token only loopback hosts are served.
#[derive(Clone, Debug, Default)]
pub struct AccessConfig {
    pub token: Option<String>,
}

impl AccessConfig {
    pub fn local_only() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

/// Axum middleware enforcing [`AccessConfig`].
///
/// Checking `Host` rather than the peer address also turns away DNS-rebound
/// pages, whose requests carry the attacker's hostname.
pub async fn access_middleware(
    State(config): State<Arc<AccessConfig>>,
    req: Request,
    next: Next,
) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    if is_loopback_authority(host) {
        return next.run(req).await;
    }

    if let Some(token) = &config.token {
        let bearer = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let query = req.uri().query().and_then(extract_token_param);
        if bearer == Some(token.as_str()) || query == Some(token.as_str()) {
            return next.run(req).await;
        }
    }

    tracing::warn!(host = %host, path = %req.uri().path(), "rejected non-local request");
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"error":"unauthorized"}"#))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// CORS origin filter: only pages served from a loopback host may call in.
pub fn is_loopback_origin(origin: &HeaderValue) -> bool {
    origin
        .to_str()
        .ok()
        .and_then(|o| o.strip_prefix("http://").or_else(|| o.strip_prefix("https://")))
        .is_some_and(is_loopback_authority)
}

/// True for `localhost`, `127.0.0.1` and `[::1]`, with or without a port.
pub fn is_loopback_authority(authority: &str) -> bool {
    let host = match authority.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(""),
        None => authority.split(':').next().unwrap_or(""),
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn extract_token_param(query: &str) -> Option<&str> {
    query.split('&').find_map(|kv| kv.strip_prefix("token="))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
