//! Caller identity and session ownership checks.
//!
//! Real authentication providers (OAuth, API keys, GitHub App) live outside
//! this crate; the [`Authenticator`] trait is the seam they plug into. The
//! built-in [`HeaderAuthenticator`] resolves identity from trusted request
//! headers, which is what a fronting auth proxy emits and what the tests
//! drive directly.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::core::{Scope, Session};

/// The authenticated caller, as resolved by the auth collaborator.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    /// Stable user identifier
    pub user_id: String,

    /// Role used for the role env file layer; empty when unknown
    pub role: String,

    /// Admins bypass ownership checks
    pub admin: bool,

    /// Teams the caller belongs to
    pub teams: Vec<String>,

    /// Team env file associated with the caller's primary team
    pub team_env_file: Option<PathBuf>,

    /// GitHub token from the caller's credentials
    pub github_token: Option<String>,
}

impl UserContext {
    /// Whether the caller belongs to the given team.
    #[must_use]
    pub fn is_member(&self, team_id: &str) -> bool {
        self.teams.iter().any(|t| t == team_id)
    }
}

/// Whether `user` may act on `session`: admin, owner of a user-scoped
/// session, or member of a team-scoped session's team.
#[must_use]
pub fn can_access(user: &UserContext, session: &Session) -> bool {
    if user.admin {
        return true;
    }
    match session.scope {
        Scope::User => session.owner_user_id == user.user_id,
        Scope::Team => session
            .team_id
            .as_deref()
            .is_some_and(|team| user.is_member(team)),
    }
}

/// Errors from authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable credentials on the request.
    #[error("authentication required")]
    Unauthenticated,
}

/// Resolves a [`UserContext`] from request headers.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a request.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<UserContext, AuthError>;
}

/// Header-based resolver. Reads `X-User-Id`, `X-User-Role`, `X-Admin`,
/// `X-Teams` (comma-separated), and `X-Team-Env-File`. When `require_user`
/// is false, a missing `X-User-Id` falls back to a local anonymous identity.
#[derive(Debug)]
pub struct HeaderAuthenticator {
    require_user: bool,
}

impl HeaderAuthenticator {
    /// Create a resolver; `require_user` rejects requests without an
    /// identity header.
    #[must_use]
    pub fn new(require_user: bool) -> Self {
        Self { require_user }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl Authenticator for HeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<UserContext, AuthError> {
        let user_id = match header_str(headers, "x-user-id") {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ if self.require_user => return Err(AuthError::Unauthenticated),
            _ => "local".to_owned(),
        };

        let teams = header_str(headers, "x-teams")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(UserContext {
            user_id,
            role: header_str(headers, "x-user-role").unwrap_or("").to_owned(),
            admin: header_str(headers, "x-admin") == Some("true"),
            teams,
            team_env_file: header_str(headers, "x-team-env-file").map(PathBuf::from),
            github_token: None,
        })
    }
}

/// State for [`auth_middleware`].
#[derive(Clone)]
pub struct AuthMiddlewareState {
    /// The injected authenticator
    pub authenticator: Arc<dyn Authenticator>,
}

impl std::fmt::Debug for AuthMiddlewareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMiddlewareState").finish_non_exhaustive()
    }
}

/// Middleware resolving the caller and inserting a [`UserContext`] into
/// request extensions. Preflight OPTIONS requests pass through
/// unauthenticated so CORS keeps working.
pub async fn auth_middleware(
    State(state): State<AuthMiddlewareState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.method() == axum::http::Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let user = state
        .authenticator
        .authenticate(request.headers())
        .await
        .map_err(|e| {
            tracing::debug!(error = %e, "request rejected by authenticator");
            StatusCode::UNAUTHORIZED
        })?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
