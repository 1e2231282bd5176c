//! Per-session streaming reverse proxy.
//!
//! Forwards a request to the session's worker, streaming the response body
//! frame-by-frame with no buffering, so SSE events reach the client as
//! soon as the worker emits them. Response headers are rewritten with
//! permissive CORS, and `POST /{id}/message` bodies are sniffed (bounded)
//! to capture the session description from the first user message.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

use crate::core::session::tags;
use crate::core::{Session, SessionRegistry};

/// Upper bound on a buffered `/message` body.
const MESSAGE_SNIFF_LIMIT: usize = 1024 * 1024;

/// Headers that never cross a proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shape of an agentapi user message, for description capture.
#[derive(Debug, Deserialize)]
struct UserMessage {
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

/// Apply the permissive CORS contract to a header map.
pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-credentials",
        HeaderValue::from_static("true"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization, X-User-Id, X-User-Role, X-Teams"),
    );
}

/// 204 preflight response with CORS headers.
#[must_use]
pub fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(response.headers_mut());
    response
}

/// Forward `req` to the session's worker, returning the streamed response.
///
/// `rest` is the path after the stripped `/{id}` segment. `extra_headers`
/// are injected into the upstream request (used by the share sub-router).
pub async fn forward(
    client: &reqwest::Client,
    registry: &Arc<SessionRegistry>,
    session: &Session,
    rest: &str,
    req: Request,
    extra_headers: &[(HeaderName, HeaderValue)],
) -> Response {
    let session_id = session.id;
    let method = req.method().clone();
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let path = rest.trim_start_matches('/');
    let url = format!("http://{}/{path}{query}", session.addr);

    let original_host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let mut upstream_headers = HeaderMap::new();
    for (name, value) in req.headers() {
        let lowered = name.as_str();
        if lowered == "host" || HOP_BY_HOP.contains(&lowered) {
            continue;
        }
        upstream_headers.insert(name.clone(), value.clone());
    }
    if let Some(host) = original_host {
        if let Ok(value) = HeaderValue::from_str(&host) {
            upstream_headers.insert("x-forwarded-host", value);
        }
    }
    upstream_headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    for (name, value) in extra_headers {
        upstream_headers.insert(name.clone(), value.clone());
    }

    // POST /{id}/message is buffered (bounded) so the first user message
    // can become the session description; everything else streams through.
    let body = req.into_body();
    let upstream_body = if method == Method::POST && path == "message" {
        let bytes = match axum::body::to_bytes(body, MESSAGE_SNIFF_LIMIT).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "message body too large to forward");
                return (StatusCode::BAD_REQUEST, "message body too large").into_response();
            }
        };
        capture_description(registry, session, &bytes).await;
        reqwest::Body::from(bytes)
    } else {
        reqwest::Body::wrap_stream(body.into_data_stream())
    };

    let upstream = client
        .request(method, url.as_str())
        .headers(upstream_headers)
        .body(upstream_body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(session_id = %session_id, url = %url, error = %e, "upstream dial failed");
            let mut response = (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
            apply_cors(response.headers_mut());
            return response;
        }
    };

    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        // append keeps repeated headers (e.g. set-cookie) intact
        headers.append(name.clone(), value.clone());
    }

    let is_event_stream = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));
    if is_event_stream {
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.remove("content-length");
    }
    apply_cors(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Set `tags.description` from the first `{type:"user"}` message if the
/// session has none yet.
async fn capture_description(registry: &Arc<SessionRegistry>, session: &Session, body: &[u8]) {
    if session.description().is_some() {
        return;
    }
    let Ok(message) = serde_json::from_slice::<UserMessage>(body) else {
        return;
    };
    if message.kind != "user" || message.content.is_empty() {
        return;
    }
    let updated = registry
        .update(session.id, |s| {
            s.tags
                .entry(tags::DESCRIPTION.to_owned())
                .or_insert(message.content.clone());
        })
        .await;
    if updated {
        tracing::debug!(session_id = %session.id, "captured session description");
    }
}
