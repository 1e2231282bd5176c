//! Handlers for the session routes.

use axum::extract::{Path, Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::auth::{can_access, UserContext};
use crate::backends::CreateContext;
use crate::core::session::tags;
use crate::core::{Scope, SessionError, SessionFilter, StartRequest};
use crate::env::{self, EnvSources};

use super::proxy;
use super::server::AppState;
use super::types::{DeleteResponse, SearchResponse, SessionSummary, StartResponse};

/// Handler-level error mapped onto the HTTP error taxonomy.
#[derive(Debug)]
pub enum AppError {
    /// 400
    BadRequest(String),
    /// 403
    Forbidden(String),
    /// 404
    NotFound(String),
    /// 410
    Gone(String),
    /// 500 with a descriptive body; the caller may retry with backoff
    ResourceExhausted(String),
    /// 500
    Internal(anyhow::Error),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound { session_id } => {
                Self::NotFound(format!("session {session_id} not found"))
            }
            SessionError::InvalidRequest { reason } => Self::BadRequest(reason),
            SessionError::NoPortAvailable { .. } => Self::ResourceExhausted(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Gone(msg) => (StatusCode::GONE, msg),
            Self::ResourceExhausted(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal error: {err}"),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// `GET /health`.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Explicit 204 preflight handler.
pub async fn preflight() -> Response {
    proxy::preflight_response()
}

/// Resolve the GitHub token for the worker: request param, then caller
/// credentials, then the control plane's own environment.
fn resolve_github_token(request: &StartRequest, user: &UserContext) -> Option<String> {
    request
        .params
        .github_token
        .clone()
        .or_else(|| user.github_token.clone())
        .or_else(|| std::env::var("GITHUB_TOKEN").ok())
        .or_else(|| std::env::var("GITHUB_PERSONAL_ACCESS_TOKEN").ok())
        .filter(|t| !t.is_empty())
}

/// `POST /start`: validate scope, compose the environment, and hand the
/// session to the backend.
pub async fn start_session(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, AppError> {
    let scope = request.scope.unwrap_or_default();

    let team_id = match scope {
        Scope::User => None,
        Scope::Team => {
            let team_id = request
                .team_id
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    AppError::BadRequest("team scope requires a team_id".to_owned())
                })?;
            if !user.admin && !user.is_member(&team_id) {
                return Err(AppError::Forbidden(format!(
                    "caller is not a member of {team_id}"
                )));
            }
            Some(team_id)
        }
    };

    let environment = env::compose(&EnvSources {
        role_env_root: state.role_env_root.clone(),
        user_role: user.role.clone(),
        auth_team_env_file: user.team_env_file.clone(),
        tag_env_file: request.tags.get(tags::ENV_FILE).map(PathBuf::from),
        request_env: request.environment.clone(),
    });

    let github_token = resolve_github_token(&request, &user);

    let id = Uuid::new_v4();
    let ctx = CreateContext {
        owner_user_id: user.user_id.clone(),
        scope,
        team_id,
        environment,
        github_token,
        request,
    };

    state.backend.create(id, ctx).await?;
    tracing::info!(session_id = %id, user_id = %user.user_id, %scope, "session start accepted");
    Ok(Json(StartResponse { session_id: id }))
}

/// Build a [`SessionFilter`] from `/search` query parameters.
fn filter_from_query(params: &HashMap<String, String>) -> Result<SessionFilter, AppError> {
    let mut filter = SessionFilter {
        user_id: params.get("user_id").cloned(),
        team_id: params.get("team_id").cloned(),
        ..Default::default()
    };

    if let Some(raw) = params.get("status") {
        filter.status = Some(
            raw.parse()
                .map_err(|_| AppError::BadRequest(format!("invalid status: {raw}")))?,
        );
    }
    if let Some(raw) = params.get("scope") {
        filter.scope = Some(
            raw.parse()
                .map_err(|_| AppError::BadRequest(format!("invalid scope: {raw}")))?,
        );
    }
    for (key, value) in params {
        if let Some(tag_key) = key.strip_prefix("tag.") {
            filter.tags.insert(tag_key.to_owned(), value.clone());
        }
    }

    Ok(filter)
}

/// `GET /search`: list sessions, constrained to what the caller can
/// access, newest first.
pub async fn search_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<SearchResponse>, AppError> {
    let filter = filter_from_query(&params)?;
    let mut sessions = state.backend.list(&filter).await;
    if !user.admin {
        sessions.retain(|s| can_access(&user, s));
    }

    let summaries = sessions.iter().map(SessionSummary::from).collect();
    Ok(Json(SearchResponse {
        sessions: summaries,
    }))
}

/// `DELETE /sessions/{id}`: tear a session down.
pub async fn delete_session(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let id: Uuid = id
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid session id: {id}")))?;

    let session = state
        .backend
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
    if !can_access(&user, &session) {
        return Err(AppError::Forbidden("not authorized for this session".to_owned()));
    }

    state.backend.delete(id).await?;

    // The share (if any) dies with the session; failures only log
    if let Err(e) = state.shares.delete(id).await {
        tracing::debug!(session_id = %id, error = %e, "share cleanup failed");
    }

    Ok(Json(DeleteResponse {
        message: "session terminated".to_owned(),
        session_id: id,
        status: "terminated".to_owned(),
    }))
}

/// `ANY /{id}`: proxy to the worker's root path.
pub async fn session_proxy_root(
    state: State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    proxy_to_session(state, id, String::new(), req).await
}

/// `ANY /{id}/{…rest}`: proxy to the worker.
pub async fn session_proxy(
    state: State<AppState>,
    Path((id, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy_to_session(state, id, rest, req).await
}

async fn proxy_to_session(
    State(state): State<AppState>,
    id: String,
    rest: String,
    req: Request,
) -> Response {
    // The session lookup applies to every request; only the ownership
    // check is skipped for preflight
    let Ok(id) = id.parse::<Uuid>() else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let Some(session) = state.backend.get(id).await else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    if req.method() == Method::OPTIONS {
        return proxy::preflight_response();
    }

    // The auth middleware put the caller into extensions for every
    // non-OPTIONS request
    let authorized = req
        .extensions()
        .get::<UserContext>()
        .is_some_and(|user| can_access(user, &session));
    if !authorized {
        return (StatusCode::FORBIDDEN, "not authorized for this session").into_response();
    }

    proxy::forward(&state.http, &state.registry, &session, &rest, req, &[]).await
}
