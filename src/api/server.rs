//! Router assembly and shared handler state.

use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AuthMiddlewareState, Authenticator};
use crate::backends::SessionBackend;
use crate::config::Config;
use crate::core::SessionRegistry;

use super::handlers;
use super::proxy;
use super::share::{self, ShareRepository};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    /// The session backend (local or Kubernetes)
    pub backend: Arc<dyn SessionBackend>,

    /// The registry behind the backend, for proxy-side tag updates
    pub registry: Arc<SessionRegistry>,

    /// Share repository
    pub shares: Arc<dyn ShareRepository>,

    /// Upstream HTTP client for proxying
    pub http: reqwest::Client,

    /// Role env file directory, when that layer is enabled
    pub role_env_root: Option<PathBuf>,

    /// Share token lifetime
    pub share_ttl_secs: u64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Assemble handler state from configuration and injected
    /// collaborators.
    #[must_use]
    pub fn new(
        config: &Config,
        backend: Arc<dyn SessionBackend>,
        registry: Arc<SessionRegistry>,
        shares: Arc<dyn ShareRepository>,
    ) -> Self {
        let role_env_root = config
            .role_env_files
            .enabled
            .then(|| config.role_env_files.path.clone());
        Self {
            backend,
            registry,
            shares,
            http: reqwest::Client::new(),
            role_env_root,
            share_ttl_secs: config.share.ttl_secs,
        }
    }
}

/// Append the permissive CORS contract to every response.
async fn cors_middleware(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    proxy::apply_cors(response.headers_mut());
    response
}

/// Build the full router.
///
/// Route shape (leaf routes first):
/// - `GET  /health` (public)
/// - `ANY  /s/{token}/{…rest}` (public; the token is the credential)
/// - `POST /start`, `GET /search`, `DELETE /sessions/{id}` (authenticated)
/// - `POST/GET/DELETE /sessions/{id}/share` (authenticated, share mode)
/// - `ANY  /{id}`, `ANY /{id}/{…rest}` (authenticated per-session proxy)
#[must_use]
pub fn build_router(
    state: AppState,
    authenticator: Arc<dyn Authenticator>,
    share_enabled: bool,
) -> Router {
    let mut router: Router<AppState> = Router::new().route("/health", get(handlers::health));

    if share_enabled {
        router = router.route("/s/{token}/{*rest}", any(share::shared_proxy));
    }

    let mut protected: Router<AppState> = Router::new()
        .route("/start", post(handlers::start_session))
        .route(
            "/sessions/{id}",
            axum::routing::delete(handlers::delete_session).options(handlers::preflight),
        )
        .route("/search", get(handlers::search_sessions));

    if share_enabled {
        protected = protected.route(
            "/sessions/{id}/share",
            post(share::create_share)
                .get(share::get_share)
                .delete(share::delete_share)
                .options(handlers::preflight),
        );
    }

    protected = protected
        .route("/{id}", any(handlers::session_proxy_root))
        .route("/{id}/{*rest}", any(handlers::session_proxy));

    let protected = protected.route_layer(from_fn_with_state(
        AuthMiddlewareState { authenticator },
        auth_middleware,
    ));

    router
        .merge(protected)
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(from_fn(cors_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
