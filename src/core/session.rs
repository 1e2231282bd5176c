use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Tag keys with defined semantics. Everything else is free-form.
pub mod tags {
    /// Git URL or `owner/repo` to clone into the session workdir.
    pub const REPOSITORY: &str = "repository";

    /// Path to a team env file merged into the worker environment.
    pub const ENV_FILE: &str = "env_file";

    /// Overrides `params.message` as the initial worker message.
    pub const MESSAGE: &str = "message";

    /// Populated lazily from the first user message seen by the proxy.
    pub const DESCRIPTION: &str = "description";

    /// Opaque MCP configuration blob forwarded to the worker.
    pub const MCP_CONFIGS: &str = "claude.mcp_configs";
}

/// Ownership model of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible to its owner only
    #[default]
    User,

    /// Visible to every member of the owning team
    Team,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Team => write!(f, "team"),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "team" => Ok(Self::Team),
            _ => Err(anyhow::anyhow!("invalid scope: {s}")),
        }
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Resources are being allocated
    Creating,

    /// Resources exist but the worker is not serving yet
    Starting,

    /// Worker answered a readiness check
    Active,

    /// Worker stopped answering readiness checks
    Unhealthy,

    /// Terminal error; `error_message` carries the reason
    Failed,

    /// Voluntary stop, cancellation, or worker exit
    Stopped,

    /// Worker never became ready within the start deadline
    Timeout,
}

impl SessionStatus {
    /// Whether this status ends the session's claim on its worker.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped | Self::Timeout)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "starting" => Ok(Self::Starting),
            "active" => Ok(Self::Active),
            "unhealthy" => Ok(Self::Unhealthy),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "timeout" => Ok(Self::Timeout),
            _ => Err(anyhow::anyhow!("invalid session status: {s}")),
        }
    }
}

/// Free-form parameters of a start request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StartParams {
    /// Initial message delivered to the worker once it is healthy
    pub message: Option<String>,

    /// GitHub token forwarded to the worker environment
    pub github_token: Option<String>,
}

/// Body of `POST /start`. Retained on the session for restart/description.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StartRequest {
    /// Request-layer environment variables (highest precedence)
    pub environment: HashMap<String, String>,

    /// Session tags
    pub tags: HashMap<String, String>,

    /// Message and credential parameters
    pub params: StartParams,

    /// Ownership model; defaults to user scope
    pub scope: Option<Scope>,

    /// Owning team, required for team scope
    pub team_id: Option<String>,
}

/// A single client ↔ worker binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: Uuid,

    /// Ownership model
    pub scope: Scope,

    /// User that started the session
    pub owner_user_id: String,

    /// Owning team, present iff scope is team
    pub team_id: Option<String>,

    /// Reachable `host:port` of the backing worker, stable for the
    /// session's life
    pub addr: String,

    /// Current lifecycle status
    pub status: SessionStatus,

    /// Failure reason, populated when status is failed
    pub error_message: Option<String>,

    /// When the session was registered
    pub started_at: DateTime<Utc>,

    /// Session tags (reserved keys in [`tags`])
    pub tags: HashMap<String, String>,

    /// Final merged environment handed to the worker
    pub environment: HashMap<String, String>,

    /// The originating start request
    pub request: StartRequest,
}

/// Inputs for building a new [`Session`].
#[derive(Debug, Clone)]
pub struct SessionSeed {
    /// Session identifier
    pub id: Uuid,

    /// User that started the session
    pub owner_user_id: String,

    /// Ownership model
    pub scope: Scope,

    /// Owning team, present iff scope is team
    pub team_id: Option<String>,

    /// Worker address
    pub addr: String,

    /// Initial status
    pub status: SessionStatus,

    /// Final merged environment
    pub environment: HashMap<String, String>,

    /// The originating start request
    pub request: StartRequest,
}

impl Session {
    /// Build a session from allocation results and the originating request.
    #[must_use]
    pub fn new(seed: SessionSeed) -> Self {
        let tags = seed.request.tags.clone();
        Self {
            id: seed.id,
            scope: seed.scope,
            owner_user_id: seed.owner_user_id,
            team_id: seed.team_id,
            addr: seed.addr,
            status: seed.status,
            error_message: None,
            started_at: Utc::now(),
            tags,
            environment: seed.environment,
            request: seed.request,
        }
    }

    /// Update the lifecycle status.
    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    /// Mark the session failed with a reason.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.error_message = Some(message.into());
    }

    /// The initial message for the worker: the `message` tag overrides
    /// `params.message`.
    #[must_use]
    pub fn initial_message(&self) -> Option<&str> {
        self.tags
            .get(tags::MESSAGE)
            .or(self.request.params.message.as_ref())
            .map(String::as_str)
            .filter(|m| !m.is_empty())
    }

    /// The lazily captured description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.tags.get(tags::DESCRIPTION).map(String::as_str)
    }

    /// The repository tag, if any.
    #[must_use]
    pub fn repository(&self) -> Option<&str> {
        self.tags.get(tags::REPOSITORY).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(request: StartRequest) -> SessionSeed {
        SessionSeed {
            id: Uuid::new_v4(),
            owner_user_id: "alice".to_owned(),
            scope: Scope::User,
            team_id: None,
            addr: "127.0.0.1:9000".to_owned(),
            status: SessionStatus::Active,
            environment: HashMap::new(),
            request,
        }
    }

    #[test]
    fn message_tag_overrides_params() {
        let mut request = StartRequest::default();
        request.params.message = Some("from params".to_owned());
        request
            .tags
            .insert(tags::MESSAGE.to_owned(), "from tag".to_owned());
        let session = Session::new(seed(request));
        assert_eq!(session.initial_message(), Some("from tag"));
    }

    #[test]
    fn empty_message_is_none() {
        let mut request = StartRequest::default();
        request.params.message = Some(String::new());
        let session = Session::new(seed(request));
        assert_eq!(session.initial_message(), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Timeout.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Creating.is_terminal());
    }

    #[test]
    fn status_round_trips_through_serde() {
        let json = serde_json::to_string(&SessionStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
        let status: SessionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, SessionStatus::Unhealthy);
    }

    #[test]
    fn scope_parses() {
        assert_eq!("team".parse::<Scope>().unwrap(), Scope::Team);
        assert!("global".parse::<Scope>().is_err());
    }
}
