//! In-memory index of live sessions.
//!
//! The registry is the single source of truth for which sessions exist. Both
//! backends insert before spawning and remove after cleanup, so a `get`
//! following a successful start always sees the session, and the registry
//! never holds terminal sessions past their cleanup.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::errors::SessionError;
use super::session::{Scope, Session, SessionStatus};

/// Filter for [`SessionRegistry::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Match the owning user
    pub user_id: Option<String>,

    /// Match the lifecycle status
    pub status: Option<SessionStatus>,

    /// Match the ownership scope
    pub scope: Option<Scope>,

    /// Match a single team
    pub team_id: Option<String>,

    /// Match any of these teams
    pub team_ids: Option<Vec<String>>,

    /// Every entry must be present with an equal value in the session's tags
    pub tags: HashMap<String, String>,
}

impl SessionFilter {
    /// Whether a session passes every set field.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        if let Some(ref user_id) = self.user_id {
            if session.owner_user_id != *user_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if let Some(scope) = self.scope {
            if session.scope != scope {
                return false;
            }
        }
        if let Some(ref team_id) = self.team_id {
            if session.team_id.as_deref() != Some(team_id.as_str()) {
                return false;
            }
        }
        if let Some(ref team_ids) = self.team_ids {
            let member = session
                .team_id
                .as_deref()
                .is_some_and(|t| team_ids.iter().any(|want| want == t));
            if !member {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(k, v)| session.tags.get(k) == Some(v))
    }
}

/// Reader-writer-locked `id → Session` map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails if the ID is already present.
    pub async fn insert(&self, session: Session) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(SessionError::AlreadyExists {
                session_id: session.id,
            });
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    /// Clone out a session by ID.
    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Remove a session, returning it if it was present.
    pub async fn remove(&self, id: Uuid) -> Option<Session> {
        self.sessions.write().await.remove(&id)
    }

    /// Apply a mutation to a registered session. Returns false when the
    /// session is gone.
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) => {
                mutate(session);
                true
            }
            None => false,
        }
    }

    /// List matching sessions, newest first.
    pub async fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut matched: Vec<Session> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matched
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// IDs of every registered session.
    pub async fn ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{SessionSeed, StartRequest};

    fn session(owner: &str, scope: Scope, team: Option<&str>) -> Session {
        Session::new(SessionSeed {
            id: Uuid::new_v4(),
            owner_user_id: owner.to_owned(),
            scope,
            team_id: team.map(ToOwned::to_owned),
            addr: "127.0.0.1:9000".to_owned(),
            status: SessionStatus::Active,
            environment: HashMap::new(),
            request: StartRequest::default(),
        })
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let registry = SessionRegistry::new();
        let s = session("alice", Scope::User, None);
        registry.insert(s.clone()).await.unwrap();
        let err = registry.insert(s).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn remove_is_idempotent_on_absence() {
        let registry = SessionRegistry::new();
        let s = session("alice", Scope::User, None);
        let id = s.id;
        registry.insert(s).await.unwrap();
        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert!(registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn filter_by_user_and_team() {
        let registry = SessionRegistry::new();
        registry
            .insert(session("alice", Scope::User, None))
            .await
            .unwrap();
        registry
            .insert(session("bob", Scope::Team, Some("acme/devs")))
            .await
            .unwrap();

        let filter = SessionFilter {
            user_id: Some("alice".to_owned()),
            ..Default::default()
        };
        assert_eq!(registry.list(&filter).await.len(), 1);

        let filter = SessionFilter {
            team_ids: Some(vec!["acme/devs".to_owned(), "acme/ops".to_owned()]),
            ..Default::default()
        };
        let matched = registry.list(&filter).await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].owner_user_id, "bob");
    }

    #[tokio::test]
    async fn filter_by_tags() {
        let registry = SessionRegistry::new();
        let mut s = session("alice", Scope::User, None);
        s.tags.insert("env".to_owned(), "prod".to_owned());
        registry.insert(s).await.unwrap();

        let mut tags = HashMap::new();
        tags.insert("env".to_owned(), "prod".to_owned());
        let filter = SessionFilter {
            tags,
            ..Default::default()
        };
        assert_eq!(registry.list(&filter).await.len(), 1);

        let mut tags = HashMap::new();
        tags.insert("env".to_owned(), "dev".to_owned());
        let filter = SessionFilter {
            tags,
            ..Default::default()
        };
        assert!(registry.list(&filter).await.is_empty());
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let registry = SessionRegistry::new();
        for _ in 0..5 {
            registry
                .insert(session("alice", Scope::User, None))
                .await
                .unwrap();
            // Distinct timestamps
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let listed = registry.list(&SessionFilter::default()).await;
        for pair in listed.windows(2) {
            assert!(pair[0].started_at >= pair[1].started_at);
        }
    }

    #[tokio::test]
    async fn update_mutates_in_place() {
        let registry = SessionRegistry::new();
        let s = session("alice", Scope::User, None);
        let id = s.id;
        registry.insert(s).await.unwrap();
        assert!(
            registry
                .update(id, |s| s.set_status(SessionStatus::Unhealthy))
                .await
        );
        assert_eq!(
            registry.get(id).await.unwrap().status,
            SessionStatus::Unhealthy
        );
        assert!(!registry.update(Uuid::new_v4(), |_| {}).await);
    }
}
