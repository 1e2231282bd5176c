//! Error types with rich context for session and backend operations.

use thiserror::Error;
use uuid::Uuid;

/// Which backend a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One OS process per session on the control-plane host
    Local,

    /// One Deployment + Service + PVC triple per session
    Kubernetes,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session not found.
    #[error("session {session_id} not found")]
    NotFound {
        /// The session ID that was not found.
        session_id: Uuid,
    },

    /// A session with this ID is already registered.
    #[error("session {session_id} already exists")]
    AlreadyExists {
        /// The duplicate session ID.
        session_id: Uuid,
    },

    /// The request failed validation before any allocation.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// No free port in the allocator's window.
    #[error("no free port in [{base}, {end})")]
    NoPortAvailable {
        /// First port of the window.
        base: u16,
        /// One past the last port of the window.
        end: u16,
    },

    /// Backend failed to start a session's worker.
    #[error("{backend} backend failed to start session {session_id}: {source}")]
    BackendStartFailed {
        /// The session that failed to start.
        session_id: Uuid,
        /// The backend that failed.
        backend: BackendKind,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Backend failed to tear a session down.
    #[error("{backend} backend failed to stop session {session_id}: {source}")]
    BackendStopFailed {
        /// The session that failed to stop.
        session_id: Uuid,
        /// The backend that failed.
        backend: BackendKind,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Shutdown deadline elapsed with sessions still registered.
    #[error("shutdown incomplete: {remaining} session(s) still registered")]
    ShutdownIncomplete {
        /// Sessions left in the registry at the deadline.
        remaining: usize,
    },
}

impl SessionError {
    /// Shorthand for [`SessionError::NotFound`].
    #[must_use]
    pub fn not_found(session_id: Uuid) -> Self {
        Self::NotFound { session_id }
    }

    /// Shorthand for [`SessionError::InvalidRequest`].
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}
