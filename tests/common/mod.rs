//! Shared helpers for router-level tests.

// Not every test binary uses every helper
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

use corral::api::share::InMemoryShareRepository;
use corral::api::{build_router, AppState};
use corral::auth::HeaderAuthenticator;
use corral::backends::mock::MockBackend;
use corral::config::Config;
use corral::core::SessionRegistry;

/// A router wired to a mock backend plus handles into its state.
pub struct TestApp {
    pub router: Router,
    pub registry: Arc<SessionRegistry>,
    pub shares: Arc<InMemoryShareRepository>,
}

/// Build a test app: auth on (header identities), shares on, mock backend.
pub fn test_app() -> TestApp {
    let mut config = Config::default();
    config.auth.enabled = true;
    config.share.enabled = true;
    test_app_with(config)
}

/// Build a test app from explicit configuration.
pub fn test_app_with(config: Config) -> TestApp {
    let registry = Arc::new(SessionRegistry::new());
    let backend = Arc::new(MockBackend::new(Arc::clone(&registry)));
    let shares = Arc::new(InMemoryShareRepository::new());
    let state = AppState::new(
        &config,
        backend,
        Arc::clone(&registry),
        Arc::clone(&shares) as Arc<dyn corral::api::share::ShareRepository>,
    );
    let authenticator = Arc::new(HeaderAuthenticator::new(config.auth.enabled));
    let router = build_router(state, authenticator, config.share.enabled);
    TestApp {
        router,
        registry,
        shares,
    }
}

/// Send one request and return the raw response pieces.
pub async fn send_raw(
    router: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> (
    StatusCode,
    axum::http::HeaderMap,
    axum::body::Bytes,
) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, headers, bytes)
}

/// Send one request through the router; returns status and parsed JSON
/// body (Null when the body is empty or not JSON).
pub async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Headers for a plain user identity.
pub fn as_user(user: &str) -> Vec<(&str, &str)> {
    vec![("x-user-id", user)]
}
