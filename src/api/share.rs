//! Share tokens: time-bounded, read-only access to one session.
//!
//! The repository is a trait so a real deployment can plug in external
//! storage; the in-memory implementation backs tests and the standalone
//! binary.

use async_trait::async_trait;
use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::UserContext;

use super::handlers::AppError;
use super::proxy;
use super::server::AppState;
use super::types::ShareResponse;

/// Length of a generated share token.
const TOKEN_LEN: usize = 43;

/// A share record mapping a token to a session.
#[derive(Debug, Clone)]
pub struct Share {
    /// Opaque token
    pub token: String,

    /// The shared session
    pub session_id: Uuid,

    /// User that created the share
    pub created_by: String,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

impl Share {
    /// Whether the share has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Storage contract for share records.
#[async_trait]
pub trait ShareRepository: Send + Sync {
    /// Persist a share.
    async fn save(&self, share: Share) -> anyhow::Result<()>;

    /// Find the share for a session, if any.
    async fn find_by_session_id(&self, session_id: Uuid) -> Option<Share>;

    /// Find a share by its token.
    async fn find_by_token(&self, token: &str) -> Option<Share>;

    /// Remove the share for a session.
    async fn delete(&self, session_id: Uuid) -> anyhow::Result<()>;
}

/// RwLock-guarded in-memory share store.
#[derive(Debug, Default)]
pub struct InMemoryShareRepository {
    by_session: RwLock<HashMap<Uuid, Share>>,
}

impl InMemoryShareRepository {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShareRepository for InMemoryShareRepository {
    async fn save(&self, share: Share) -> anyhow::Result<()> {
        self.by_session.write().await.insert(share.session_id, share);
        Ok(())
    }

    async fn find_by_session_id(&self, session_id: Uuid) -> Option<Share> {
        self.by_session.read().await.get(&session_id).cloned()
    }

    async fn find_by_token(&self, token: &str) -> Option<Share> {
        self.by_session
            .read()
            .await
            .values()
            .find(|s| s.token == token)
            .cloned()
    }

    async fn delete(&self, session_id: Uuid) -> anyhow::Result<()> {
        self.by_session.write().await.remove(&session_id);
        Ok(())
    }
}

/// Generate an opaque URL-safe token.
fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn share_response(share: &Share) -> ShareResponse {
    ShareResponse {
        token: share.token.clone(),
        session_id: share.session_id,
        expires_at: share.expires_at,
    }
}

/// Authorize the caller for share management on a session: owner or admin.
async fn authorize_share(
    state: &AppState,
    user: &UserContext,
    id: Uuid,
) -> Result<(), AppError> {
    let session = state
        .backend
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
    if user.admin || session.owner_user_id == user.user_id {
        Ok(())
    } else {
        Err(AppError::Forbidden("not the session owner".to_owned()))
    }
}

/// `POST /sessions/{id}/share`: create (idempotently) a share for the
/// session. An existing share is returned unchanged.
pub async fn create_share(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<ShareResponse>, AppError> {
    authorize_share(&state, &user, id).await?;

    if let Some(existing) = state.shares.find_by_session_id(id).await {
        if !existing.is_expired() {
            return Ok(Json(share_response(&existing)));
        }
    }

    let ttl = Duration::from_secs(state.share_ttl_secs);
    let share = Share {
        token: generate_token(),
        session_id: id,
        created_by: user.user_id.clone(),
        created_at: Utc::now(),
        expires_at: Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24)),
    };
    state
        .shares
        .save(share.clone())
        .await
        .map_err(AppError::Internal)?;

    tracing::info!(session_id = %id, user_id = %user.user_id, "share created");
    Ok(Json(share_response(&share)))
}

/// `GET /sessions/{id}/share`: fetch the session's share.
pub async fn get_share(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<ShareResponse>, AppError> {
    authorize_share(&state, &user, id).await?;

    let share = state
        .shares
        .find_by_session_id(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no share for session {id}")))?;
    Ok(Json(share_response(&share)))
}

/// `DELETE /sessions/{id}/share`: revoke the session's share.
pub async fn delete_share(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    authorize_share(&state, &user, id).await?;

    if state.shares.find_by_session_id(id).await.is_none() {
        return Err(AppError::NotFound(format!("no share for session {id}")));
    }
    state.shares.delete(id).await.map_err(AppError::Internal)?;
    tracing::info!(session_id = %id, "share deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `ANY /s/{token}/{…rest}`: read-only proxy through a share token.
///
/// Only GET and OPTIONS pass; an expired token is 410 Gone.
pub async fn shared_proxy(
    State(state): State<AppState>,
    Path((token, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    // Token lookup and expiry apply to every request, preflight included
    let Some(share) = state.shares.find_by_token(&token).await else {
        return (StatusCode::NOT_FOUND, "unknown share token").into_response();
    };
    if share.is_expired() {
        return (StatusCode::GONE, "share expired").into_response();
    }

    if req.method() == Method::OPTIONS {
        return proxy::preflight_response();
    }
    if req.method() != Method::GET {
        return (StatusCode::FORBIDDEN, "shared sessions are read-only").into_response();
    }

    let Some(session) = state.backend.get(share.session_id).await else {
        return (StatusCode::NOT_FOUND, "shared session is gone").into_response();
    };

    let token_value = HeaderValue::from_str(&share.token)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    let extra = [
        (
            HeaderName::from_static("x-shared-session"),
            HeaderValue::from_static("true"),
        ),
        (HeaderName::from_static("x-share-token"), token_value),
    ];

    proxy::forward(&state.http, &state.registry, &session, &rest, req, &extra).await
}
