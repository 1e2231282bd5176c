//! In-memory backend for tests: registers sessions without spawning
//! anything.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::session::SessionSeed;
use crate::core::{
    BackendKind, Session, SessionError, SessionFilter, SessionRegistry, SessionStatus,
};

use super::traits::{CreateContext, SessionBackend};

/// Backend whose "workers" are registry entries only.
pub struct MockBackend {
    registry: Arc<SessionRegistry>,

    /// When set, `create` fails after the registry insert (exercising the
    /// cleanup path)
    fail_create: AtomicBool,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend").finish_non_exhaustive()
    }
}

impl MockBackend {
    /// Create a mock over a shared registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            fail_create: AtomicBool::new(false),
        }
    }

    /// Make subsequent `create` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// The registry this mock writes into.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn create(&self, id: Uuid, ctx: CreateContext) -> Result<Session, SessionError> {
        let session = Session::new(SessionSeed {
            id,
            owner_user_id: ctx.owner_user_id.clone(),
            scope: ctx.scope,
            team_id: ctx.team_id.clone(),
            addr: format!("127.0.0.1:{}", 20000 + (id.as_u128() % 1000) as u16),
            status: SessionStatus::Active,
            environment: ctx.environment.clone(),
            request: ctx.request.clone(),
        });

        self.registry.insert(session.clone()).await?;

        if self.fail_create.load(Ordering::SeqCst) {
            self.registry.remove(id).await;
            return Err(SessionError::BackendStartFailed {
                session_id: id,
                backend: BackendKind::Local,
                source: anyhow::anyhow!("mock create failure"),
            });
        }

        Ok(session)
    }

    async fn get(&self, id: Uuid) -> Option<Session> {
        self.registry.get(id).await
    }

    async fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        self.registry.list(filter).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), SessionError> {
        match self.registry.remove(id).await {
            Some(_) => Ok(()),
            None => Err(SessionError::not_found(id)),
        }
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<(), SessionError> {
        for id in self.registry.ids().await {
            self.registry.remove(id).await;
        }
        Ok(())
    }
}
