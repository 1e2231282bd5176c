//! Local session backend: one supervised OS process per session.
//!
//! `create` registers the session first and spawns the worker from a
//! per-session supervisor task, so a `get` right after a successful start
//! always sees the session and a failed spawn cleanly unregisters it. The
//! supervisor owns the child process; teardown escalates SIGTERM → SIGKILL
//! against the worker's process group and always reaps.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LocalConfig;
use crate::core::session::SessionSeed;
use crate::core::{
    BackendKind, Session, SessionError, SessionFilter, SessionRegistry, SessionStatus,
};

use super::launch::{self, LaunchPlan, LaunchSpec};
use super::ports::PortAllocator;
use super::traits::{CreateContext, SessionBackend};

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Outer deadline guarding a stuck `wait()` after SIGKILL.
const REAP_DEADLINE: Duration = Duration::from_secs(10);

/// How long `delete` polls for the supervisor to unregister the session.
const DELETE_POLL_DEADLINE: Duration = Duration::from_secs(5);

/// Polling step for `delete` and `shutdown`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Warm-up before the initial-message sender starts probing.
const MESSAGE_WARMUP: Duration = Duration::from_secs(2);

/// Readiness probe attempts for the initial-message sender.
const MESSAGE_HEALTH_ATTEMPTS: u32 = 30;

/// Delay between readiness probes.
const MESSAGE_HEALTH_INTERVAL: Duration = Duration::from_millis(500);

/// Cap on captured worker stderr.
const STDERR_CAP: u64 = 64 * 1024;

/// Session manager backed by local processes.
pub struct LocalBackend {
    registry: Arc<SessionRegistry>,
    ports: PortAllocator,
    config: LocalConfig,
    supervisors: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    /// Create a backend over a shared registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: LocalConfig) -> Self {
        let ports = PortAllocator::new(config.start_port);
        Self {
            registry,
            ports,
            config,
            supervisors: Arc::new(Mutex::new(HashMap::new())),
            http: reqwest::Client::new(),
        }
    }

    /// Unwind a create that failed or was deleted before its worker
    /// spawned.
    async fn abort_create(&self, id: Uuid) {
        self.supervisors.lock().await.remove(&id);
        self.registry.remove(id).await;
    }
}

#[async_trait]
impl SessionBackend for LocalBackend {
    async fn create(&self, id: Uuid, ctx: CreateContext) -> Result<Session, SessionError> {
        let port = self.ports.allocate()?;
        let addr = format!("127.0.0.1:{port}");

        // Optimistically active; the supervisor downgrades on failure
        let session = Session::new(SessionSeed {
            id,
            owner_user_id: ctx.owner_user_id.clone(),
            scope: ctx.scope,
            team_id: ctx.team_id.clone(),
            addr,
            status: SessionStatus::Active,
            environment: ctx.environment.clone(),
            request: ctx.request.clone(),
        });
        let initial_message = session.initial_message().map(ToOwned::to_owned);

        // The cancel token is registered before the registry row, so any
        // delete that can see the session can also reach the in-flight
        // create
        let cancel = CancellationToken::new();
        self.supervisors.lock().await.insert(id, cancel.clone());

        // Registry insert happens-before spawn
        if let Err(e) = self.registry.insert(session.clone()).await {
            self.supervisors.lock().await.remove(&id);
            return Err(e);
        }

        // Workdir provisioning may run a git clone; stay cancellable so a
        // concurrent delete aborts it instead of orphaning a worker
        let prepared = tokio::select! {
            result = launch::prepare(LaunchSpec {
                session_id: id,
                port,
                agentapi_bin: &self.config.agentapi_bin,
                workdir_root: &self.config.workdir_root,
                environment: &ctx.environment,
                tags: &session.tags,
                github_token: ctx.github_token.as_deref(),
            }) => Some(result),
            () = cancel.cancelled() => None,
        };

        let plan = match prepared {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => {
                self.abort_create(id).await;
                return Err(SessionError::BackendStartFailed {
                    session_id: id,
                    backend: BackendKind::Local,
                    source: e,
                });
            }
            None => {
                self.abort_create(id).await;
                return Err(SessionError::BackendStartFailed {
                    session_id: id,
                    backend: BackendKind::Local,
                    source: anyhow::anyhow!("session deleted while provisioning"),
                });
            }
        };

        let supervisor = Supervisor {
            registry: Arc::clone(&self.registry),
            supervisors: Arc::clone(&self.supervisors),
            http: self.http.clone(),
            id,
            port,
            initial_message,
            cancel,
        };
        tokio::spawn(supervisor.run(plan));

        tracing::info!(session_id = %id, port, "local session started");
        Ok(session)
    }

    async fn get(&self, id: Uuid) -> Option<Session> {
        self.registry.get(id).await
    }

    async fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        self.registry.list(filter).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), SessionError> {
        if self.registry.get(id).await.is_none() {
            return Err(SessionError::not_found(id));
        }

        // The token exists for the session's whole life, create included;
        // cancelling reaches an in-flight prepare as well as a running
        // supervisor. A missing entry means the supervisor is mid-exit.
        let cancel = self.supervisors.lock().await.get(&id).cloned();
        match cancel {
            Some(cancel) => cancel.cancel(),
            None => {
                self.registry.remove(id).await;
                return Ok(());
            }
        }

        // The supervisor removes the entry once the worker is reaped
        let deadline = tokio::time::Instant::now() + DELETE_POLL_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            if self.registry.get(id).await.is_none() {
                tracing::info!(session_id = %id, "local session deleted");
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tracing::warn!(session_id = %id, "supervisor missed the delete deadline, force-removing");
        self.registry.remove(id).await;
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), SessionError> {
        let cancels: Vec<CancellationToken> =
            self.supervisors.lock().await.values().cloned().collect();
        for cancel in cancels {
            cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.registry.is_empty().await {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let remaining = self.registry.len().await;
        if remaining == 0 {
            Ok(())
        } else {
            Err(SessionError::ShutdownIncomplete { remaining })
        }
    }
}

/// Per-session supervisor: spawns the worker, relays the initial message,
/// and guarantees the registry entry is gone when the worker is.
struct Supervisor {
    registry: Arc<SessionRegistry>,
    supervisors: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    http: reqwest::Client,
    id: Uuid,
    port: u16,
    initial_message: Option<String>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self, plan: LaunchPlan) {
        let mut command = tokio::process::Command::new(&plan.program);
        command
            .args(&plan.args)
            .current_dir(&plan.workdir)
            .env_clear()
            .envs(&plan.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Own process group so the whole worker tree can be signalled
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(session_id = %self.id, program = %plan.program, error = %e, "failed to spawn worker");
                self.finish().await;
                return;
            }
        };

        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

        // Capture stderr off to the side; flushed only on an error exit
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.take(STDERR_CAP).read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(message) = self.initial_message.clone() {
            tokio::spawn(send_initial_message(
                self.http.clone(),
                self.port,
                message,
                self.cancel.child_token(),
            ));
        }

        let natural_exit = tokio::select! {
            status = child.wait() => Some(status.ok()),
            () = self.cancel.cancelled() => None,
        };
        let exit = match natural_exit {
            Some(status) => status,
            None => self.terminate(&mut child, pgid).await,
        };

        match exit.and_then(|status| status.code()) {
            Some(1) => {
                let stderr = match stderr_task {
                    Some(task) => tokio::time::timeout(Duration::from_secs(1), task)
                        .await
                        .ok()
                        .and_then(Result::ok)
                        .unwrap_or_default(),
                    None => String::new(),
                };
                tracing::warn!(session_id = %self.id, stderr = %stderr.trim(), "worker exited with an error");
            }
            code => {
                tracing::info!(session_id = %self.id, exit_code = ?code, "worker exited");
            }
        }

        self.finish().await;
    }

    /// SIGTERM the worker's process group, escalate to SIGKILL after the
    /// grace period, and always reap the child.
    async fn terminate(
        &self,
        child: &mut tokio::process::Child,
        pgid: Option<Pid>,
    ) -> Option<std::process::ExitStatus> {
        if let Some(pgid) = pgid {
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                tracing::debug!(session_id = %self.id, error = %e, "SIGTERM failed (worker may be gone)");
            }
        }

        if let Ok(status) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
            return status.ok();
        }

        tracing::warn!(session_id = %self.id, "worker ignored SIGTERM, sending SIGKILL");
        if let Some(pgid) = pgid {
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                tracing::debug!(session_id = %self.id, error = %e, "SIGKILL failed");
            }
        }

        match tokio::time::timeout(REAP_DEADLINE, child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                tracing::error!(session_id = %self.id, "worker unreapable after SIGKILL");
                None
            }
        }
    }

    /// Remove the session from the registry and drop the supervisor handle.
    /// The allocated port counts as released once this returns.
    async fn finish(&self) {
        self.supervisors.lock().await.remove(&self.id);
        self.registry.remove(self.id).await;
        tracing::info!(session_id = %self.id, "session ended");
    }
}

/// One-shot initial-message delivery: wait for the worker to pass a health
/// check, then post the message. Failures are logged and swallowed.
async fn send_initial_message(
    http: reqwest::Client,
    port: u16,
    message: String,
    cancel: CancellationToken,
) {
    tokio::select! {
        () = tokio::time::sleep(MESSAGE_WARMUP) => {}
        () = cancel.cancelled() => return,
    }

    let health_url = format!("http://127.0.0.1:{port}/health");
    let mut healthy = false;
    for _ in 0..MESSAGE_HEALTH_ATTEMPTS {
        if cancel.is_cancelled() {
            return;
        }
        match http.get(&health_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                healthy = true;
                break;
            }
            _ => tokio::time::sleep(MESSAGE_HEALTH_INTERVAL).await,
        }
    }
    if !healthy {
        tracing::warn!(port, "worker never became healthy, dropping initial message");
        return;
    }

    let body = serde_json::json!({ "type": "user", "content": message });
    match http
        .post(format!("http://127.0.0.1:{port}/message"))
        .json(&body)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(port, "delivered initial message");
        }
        Ok(resp) => {
            tracing::warn!(port, status = %resp.status(), "initial message rejected");
        }
        Err(e) => {
            tracing::warn!(port, error = %e, "initial message delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Scope, StartRequest};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// A stand-in worker: a script that ignores its arguments and sleeps.
    fn stub_worker(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("agentapi-stub");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn backend_with(bin: &str, start_port: u16, dir: &tempfile::TempDir) -> LocalBackend {
        let registry = Arc::new(SessionRegistry::new());
        LocalBackend::new(
            registry,
            LocalConfig {
                start_port,
                workdir_root: dir.path().join("sessions"),
                agentapi_bin: bin.to_owned(),
            },
        )
    }

    fn ctx(owner: &str) -> CreateContext {
        CreateContext {
            owner_user_id: owner.to_owned(),
            scope: Scope::User,
            team_id: None,
            environment: HashMap::new(),
            github_token: None,
            request: StartRequest::default(),
        }
    }

    #[tokio::test]
    async fn create_then_delete_reaps_the_worker() {
        let dir = tempfile::TempDir::new().unwrap();
        let bin = stub_worker(&dir);
        let backend = backend_with(bin.to_str().unwrap(), 19500, &dir);

        let id = Uuid::new_v4();
        let session = backend.create(id, ctx("alice")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(backend.get(id).await.is_some());

        backend.delete(id).await.unwrap();
        assert!(backend.get(id).await.is_none());

        // Idempotence beyond the first delete: NotFound
        let err = backend.delete(id).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_sessions_get_distinct_ports() {
        let dir = tempfile::TempDir::new().unwrap();
        let bin = stub_worker(&dir);
        let backend = backend_with(bin.to_str().unwrap(), 19600, &dir);

        let a = backend.create(Uuid::new_v4(), ctx("alice")).await.unwrap();
        let b = backend.create(Uuid::new_v4(), ctx("alice")).await.unwrap();
        assert_ne!(a.addr, b.addr);

        backend.shutdown(Duration::from_secs(10)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_spawn_unregisters_the_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = backend_with("/nonexistent/agentapi", 19700, &dir);

        let id = Uuid::new_v4();
        // Create succeeds optimistically; the supervisor cleans up
        backend.create(id, ctx("alice")).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while backend.get(id).await.is_some() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(backend.get(id).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_drains_every_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let bin = stub_worker(&dir);
        let backend = backend_with(bin.to_str().unwrap(), 19800, &dir);

        for _ in 0..3 {
            backend.create(Uuid::new_v4(), ctx("alice")).await.unwrap();
        }
        backend.shutdown(Duration::from_secs(10)).await.unwrap();
        assert!(backend.list(&SessionFilter::default()).await.is_empty());
    }
}
