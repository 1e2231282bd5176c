use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{Scope, Session, SessionError, SessionFilter, StartRequest};

/// Validated inputs for creating a session, produced by the start handler
/// after authentication and environment composition.
#[derive(Debug, Clone)]
pub struct CreateContext {
    /// User that owns the session
    pub owner_user_id: String,

    /// Ownership model
    pub scope: Scope,

    /// Owning team, present iff scope is team
    pub team_id: Option<String>,

    /// Final merged worker environment
    pub environment: HashMap<String, String>,

    /// GitHub token resolved from request params or caller credentials
    pub github_token: Option<String>,

    /// The originating start request, retained on the session
    pub request: StartRequest,
}

/// The session manager contract. Local and Kubernetes implementations are
/// interchangeable behind this trait; the router stays oblivious.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Allocate resources, register the session, and start its worker.
    ///
    /// The registry insert happens before the worker spawn; a spawn failure
    /// removes the entry again.
    async fn create(&self, id: Uuid, ctx: CreateContext) -> Result<Session, SessionError>;

    /// Look up a session by ID.
    async fn get(&self, id: Uuid) -> Option<Session>;

    /// List sessions matching the filter, newest first.
    async fn list(&self, filter: &SessionFilter) -> Vec<Session>;

    /// Tear a session down. Returns only after the registry entry is gone;
    /// deleting an unknown ID fails with `NotFound`.
    async fn delete(&self, id: Uuid) -> Result<(), SessionError>;

    /// Tear all sessions down within the deadline.
    async fn shutdown(&self, timeout: Duration) -> Result<(), SessionError>;
}
