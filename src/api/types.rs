//! Typed DTOs for the HTTP boundary. Env and tags stay opaque string maps;
//! everything else is structured.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::{Scope, Session, SessionStatus};

pub use crate::core::{StartParams, StartRequest};

/// Body of a successful `POST /start`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    /// The new session's identifier
    pub session_id: Uuid,
}

/// One session in a `GET /search` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier
    pub session_id: Uuid,

    /// Owning user
    pub user_id: String,

    /// Ownership scope
    pub scope: Scope,

    /// Owning team, when team-scoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    /// Lifecycle status
    pub status: SessionStatus,

    /// Failure reason, when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Registration time
    pub started_at: DateTime<Utc>,

    /// Worker address
    pub addr: String,

    /// Session tags
    pub tags: HashMap<String, String>,

    /// Lazily captured description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id,
            user_id: session.owner_user_id.clone(),
            scope: session.scope,
            team_id: session.team_id.clone(),
            status: session.status,
            error_message: session.error_message.clone(),
            started_at: session.started_at,
            addr: session.addr.clone(),
            tags: session.tags.clone(),
            description: session.description().map(ToOwned::to_owned),
        }
    }
}

/// Body of `GET /search`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Matching sessions, newest first
    pub sessions: Vec<SessionSummary>,
}

/// Body of a successful `DELETE /sessions/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Human-readable confirmation
    pub message: String,

    /// The deleted session
    pub session_id: Uuid,

    /// Always `"terminated"`
    pub status: String,
}

/// Body of `POST /sessions/{id}/share` and `GET /sessions/{id}/share`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShareResponse {
    /// Opaque share token
    pub token: String,

    /// The shared session
    pub session_id: Uuid,

    /// When the token stops working
    pub expires_at: DateTime<Utc>,
}
