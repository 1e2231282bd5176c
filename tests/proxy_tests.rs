//! Reverse-proxy tests against a real in-process upstream worker.

mod common;

use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{as_user, send, send_raw, test_app};
use serde_json::json;
use std::net::SocketAddr;

/// Spin up a stand-in worker; returns its address.
async fn spawn_upstream() -> SocketAddr {
    async fn events() -> impl IntoResponse {
        (
            [("content-type", "text/event-stream")],
            "data: one\n\ndata: two\n\n",
        )
    }

    async fn hello() -> &'static str {
        "hello from worker"
    }

    async fn echo_headers(headers: HeaderMap) -> Json<serde_json::Value> {
        let mut out = serde_json::Map::new();
        for (name, value) in &headers {
            out.insert(
                name.as_str().to_owned(),
                json!(value.to_str().unwrap_or("")),
            );
        }
        Json(serde_json::Value::Object(out))
    }

    async fn message(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
        Json(json!({ "ok": true, "echo": body }))
    }

    let upstream = Router::new()
        .route("/events", get(events))
        .route("/hello", get(hello))
        .route("/headers", get(echo_headers))
        .route("/message", post(message));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.expect("upstream serve");
    });
    addr
}

/// Start a session through the API and point its addr at the upstream.
async fn started_session(app: &common::TestApp, upstream: SocketAddr) -> String {
    let (status, body) = send(
        &app.router,
        "POST",
        "/start",
        &as_user("alice"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, 200);
    let id_str = body["session_id"].as_str().expect("session_id").to_owned();
    let id: uuid::Uuid = id_str.parse().expect("uuid");
    app.registry
        .update(id, |s| s.addr = upstream.to_string())
        .await;
    id_str
}

#[tokio::test]
async fn proxies_to_the_worker_with_cors() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    let (status, headers, body) = send_raw(
        &app.router,
        "GET",
        &format!("/{id}/hello"),
        &as_user("alice"),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(&body[..], b"hello from worker");
    assert_eq!(headers["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn forwards_x_forwarded_headers() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    let (status, _, body) = send_raw(
        &app.router,
        "GET",
        &format!("/{id}/headers"),
        &[("x-user-id", "alice"), ("host", "corral.example.com")],
        None,
    )
    .await;
    assert_eq!(status, 200);
    let echoed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(echoed["x-forwarded-host"], "corral.example.com");
    assert_eq!(echoed["x-forwarded-proto"], "http");
}

#[tokio::test]
async fn sse_responses_get_streaming_headers() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    let (status, headers, body) = send_raw(
        &app.router,
        "GET",
        &format!("/{id}/events"),
        &as_user("alice"),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(headers["cache-control"], "no-cache");
    assert!(!headers.contains_key("content-length"));
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("data: one"));
    assert!(text.contains("data: two"));
}

#[tokio::test]
async fn first_user_message_becomes_the_description() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    let (status, _) = send(
        &app.router,
        "POST",
        &format!("/{id}/message"),
        &as_user("alice"),
        Some(json!({ "type": "user", "content": "hi" })),
    )
    .await;
    assert_eq!(status, 200);

    let (_, body) = send(&app.router, "GET", "/search", &as_user("alice"), None).await;
    assert_eq!(body["sessions"][0]["tags"]["description"], "hi");
    assert_eq!(body["sessions"][0]["description"], "hi");

    // Later messages do not overwrite it
    send(
        &app.router,
        "POST",
        &format!("/{id}/message"),
        &as_user("alice"),
        Some(json!({ "type": "user", "content": "something else" })),
    )
    .await;
    let (_, body) = send(&app.router, "GET", "/search", &as_user("alice"), None).await;
    assert_eq!(body["sessions"][0]["tags"]["description"], "hi");
}

#[tokio::test]
async fn ownership_enforced_on_the_proxy_path() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    let (status, _, _) = send_raw(
        &app.router,
        "GET",
        &format!("/{id}/hello"),
        &as_user("bob"),
        None,
    )
    .await;
    assert_eq!(status, 403);

    let (status, _, _) = send_raw(
        &app.router,
        "GET",
        &format!("/{}/hello", uuid::Uuid::new_v4()),
        &as_user("alice"),
        None,
    )
    .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn preflight_on_the_proxy_path() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    let (status, headers, _) = send_raw(
        &app.router,
        "OPTIONS",
        &format!("/{id}/anything"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, 204);
    assert_eq!(headers["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn preflight_still_requires_an_existing_session() {
    let app = test_app();

    // Unknown id: the lookup applies to preflight too
    let (status, _, _) = send_raw(
        &app.router,
        "OPTIONS",
        &format!("/{}/anything", uuid::Uuid::new_v4()),
        &[],
        None,
    )
    .await;
    assert_eq!(status, 404);

    // Malformed id is just as absent
    let (status, _, _) = send_raw(&app.router, "OPTIONS", "/not-a-uuid/anything", &[], None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn dead_worker_yields_502() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    // Repoint the session at a port nothing listens on
    let uuid: uuid::Uuid = id.parse().expect("uuid");
    app.registry
        .update(uuid, |s| s.addr = "127.0.0.1:1".to_owned())
        .await;

    let (status, _, _) = send_raw(
        &app.router,
        "GET",
        &format!("/{id}/hello"),
        &as_user("alice"),
        None,
    )
    .await;
    assert_eq!(status, 502);
}

#[tokio::test]
async fn shared_sessions_are_read_only() {
    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;

    let (status, share) = send(
        &app.router,
        "POST",
        &format!("/sessions/{id}/share"),
        &as_user("alice"),
        None,
    )
    .await;
    assert_eq!(status, 200);
    let token = share["token"].as_str().expect("token").to_owned();

    // GET passes without credentials, and the worker sees the share headers
    let (status, _, body) = send_raw(
        &app.router,
        "GET",
        &format!("/s/{token}/headers"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, 200);
    let echoed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(echoed["x-shared-session"], "true");
    assert_eq!(echoed["x-share-token"], token.as_str());

    // Writes are rejected
    let (status, _, _) = send_raw(
        &app.router,
        "POST",
        &format!("/s/{token}/message"),
        &[],
        Some(json!({ "type": "user", "content": "nope" })),
    )
    .await;
    assert_eq!(status, 403);

    // Unknown tokens are 404
    let (status, _, _) = send_raw(&app.router, "GET", "/s/bogustoken/hello", &[], None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn expired_share_is_gone() {
    use corral::api::share::{Share, ShareRepository};

    let app = test_app();
    let upstream = spawn_upstream().await;
    let id = started_session(&app, upstream).await;
    let uuid: uuid::Uuid = id.parse().expect("uuid");

    app.shares
        .save(Share {
            token: "expiredtoken".to_owned(),
            session_id: uuid,
            created_by: "alice".to_owned(),
            created_at: chrono::Utc::now() - chrono::Duration::hours(2),
            expires_at: chrono::Utc::now() - chrono::Duration::hours(1),
        })
        .await
        .expect("save share");

    let (status, _, _) = send_raw(&app.router, "GET", "/s/expiredtoken/hello", &[], None).await;
    assert_eq!(status, 410);
}
