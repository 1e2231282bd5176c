//! Kubernetes session backend: one PVC + Deployment + Service triple per
//! session.
//!
//! Object creation runs PVC → (Secret) → Deployment → Service with reverse
//! best-effort cleanup on partial failure. A per-session watcher polls the
//! Deployment for readiness and inspects pod container states to surface
//! image-pull and crash-loop failures as session errors.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::KubernetesSessionConfig;
use crate::core::session::SessionSeed;
use crate::core::{
    BackendKind, Session, SessionError, SessionFilter, SessionRegistry, SessionStatus,
};

use super::traits::{CreateContext, SessionBackend};

pub use spec::{deployment_name, pvc_name, secret_name, service_name, SESSION_ID_LABEL};

/// Fast poll cadence while waiting for first readiness.
const STARTUP_POLL: Duration = Duration::from_secs(2);

/// Slow poll cadence once the session has been ready (or timed out).
const STEADY_POLL: Duration = Duration::from_secs(10);

/// Session manager backed by Kubernetes objects.
pub struct KubernetesBackend {
    client: Client,
    registry: Arc<SessionRegistry>,
    config: KubernetesSessionConfig,
    watchers: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl std::fmt::Debug for KubernetesBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KubernetesBackend {
    /// Create a backend over a shared registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the Kubernetes client cannot be constructed.
    pub async fn new(
        registry: Arc<SessionRegistry>,
        config: KubernetesSessionConfig,
    ) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self {
            client,
            registry,
            config,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Create the session's objects in order; the caller cleans up on error.
    async fn create_objects(
        &self,
        session: &Session,
        initial_message: Option<&str>,
        github_token: Option<&str>,
    ) -> anyhow::Result<()> {
        let pp = PostParams::default();

        let pvc = spec::build_pvc(&self.config, session);
        self.pvcs()
            .create(&pp, &pvc)
            .await
            .map_err(|e| anyhow::anyhow!("PVC creation failed: {e}"))?;

        if let Some(message) = initial_message {
            let secret = spec::build_initial_message_secret(&self.config, session, message);
            self.secrets()
                .create(&pp, &secret)
                .await
                .map_err(|e| anyhow::anyhow!("initial-message Secret creation failed: {e}"))?;
        }

        let deployment = spec::build_deployment(
            &self.config,
            session,
            spec::WorkerOptions {
                with_message_sidecar: initial_message.is_some(),
                clone_url: clone_url_for(session),
                github_token: github_token.map(ToOwned::to_owned),
            },
        );
        self.deployments()
            .create(&pp, &deployment)
            .await
            .map_err(|e| anyhow::anyhow!("Deployment creation failed: {e}"))?;

        let service = spec::build_service(&self.config, session);
        self.services()
            .create(&pp, &service)
            .await
            .map_err(|e| anyhow::anyhow!("Service creation failed: {e}"))?;

        Ok(())
    }

    /// Delete the session's objects (Service, Deployment, Secret, PVC),
    /// collecting every error that is not NotFound.
    async fn delete_objects(&self, id: Uuid) -> Vec<String> {
        let dp = DeleteParams::foreground();
        let mut errors = Vec::new();

        if let Err(e) = self.services().delete(&service_name(id), &dp).await {
            if !is_not_found(&e) {
                errors.push(format!("service: {e}"));
            }
        }
        if let Err(e) = self.deployments().delete(&deployment_name(id), &dp).await {
            if !is_not_found(&e) {
                errors.push(format!("deployment: {e}"));
            }
        }
        // Best-effort; the Secret only exists for sessions with a message
        if let Err(e) = self.secrets().delete(&secret_name(id), &dp).await {
            if !is_not_found(&e) {
                tracing::debug!(session_id = %id, error = %e, "initial-message secret delete failed");
            }
        }
        if let Err(e) = self.pvcs().delete(&pvc_name(id), &dp).await {
            if !is_not_found(&e) {
                errors.push(format!("pvc: {e}"));
            }
        }

        errors
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// Clone URL for the session's `repository` tag, when it parses. An
/// invalid URL is logged and the pod starts without a repo.
fn clone_url_for(session: &Session) -> Option<String> {
    let repo = session.repository()?;
    match super::launch::parse_repo_url(repo) {
        Some(url) => Some(url),
        None => {
            tracing::warn!(
                session_id = %session.id,
                repo,
                "invalid repository URL, continuing without a clone"
            );
            None
        }
    }
}

#[async_trait]
impl SessionBackend for KubernetesBackend {
    async fn create(&self, id: Uuid, ctx: CreateContext) -> Result<Session, SessionError> {
        let addr = format!(
            "{}.{}.svc.cluster.local:{}",
            service_name(id),
            self.config.namespace,
            self.config.base_port
        );

        let session = Session::new(SessionSeed {
            id,
            owner_user_id: ctx.owner_user_id.clone(),
            scope: ctx.scope,
            team_id: ctx.team_id.clone(),
            addr,
            status: SessionStatus::Creating,
            environment: ctx.environment.clone(),
            request: ctx.request.clone(),
        });
        let initial_message = session.initial_message().map(ToOwned::to_owned);

        // The cancel token is registered before the registry row, so any
        // delete that can see the session can also reach the in-flight
        // create
        let cancel = CancellationToken::new();
        self.watchers.lock().await.insert(id, cancel.clone());

        // Registry insert happens-before object creation
        if let Err(e) = self.registry.insert(session.clone()).await {
            self.watchers.lock().await.remove(&id);
            return Err(e);
        }

        // Object creation runs to completion rather than racing the token:
        // dropping an in-flight API call could create an object a cleanup
        // sweep would then miss
        let created = self
            .create_objects(
                &session,
                initial_message.as_deref(),
                ctx.github_token.as_deref(),
            )
            .await;

        if cancel.is_cancelled() {
            // A delete won the race; tear down whatever landed, including
            // objects created after the delete's own sweep
            for err in self.delete_objects(id).await {
                tracing::warn!(session_id = %id, error = %err, "cleanup after cancelled create");
            }
            self.watchers.lock().await.remove(&id);
            self.registry.remove(id).await;
            return Err(SessionError::BackendStartFailed {
                session_id: id,
                backend: BackendKind::Kubernetes,
                source: anyhow::anyhow!("session deleted while provisioning"),
            });
        }

        if let Err(e) = created {
            // Reverse cleanup of whatever was created; log secondary failures
            for err in self.delete_objects(id).await {
                tracing::warn!(session_id = %id, error = %err, "cleanup after failed create");
            }
            self.watchers.lock().await.remove(&id);
            self.registry.remove(id).await;
            return Err(SessionError::BackendStartFailed {
                session_id: id,
                backend: BackendKind::Kubernetes,
                source: e,
            });
        }

        tokio::spawn(watch_session(
            self.client.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.watchers),
            self.config.clone(),
            id,
            cancel,
        ));

        tracing::info!(
            session_id = %id,
            namespace = %self.config.namespace,
            deployment = %deployment_name(id),
            "kubernetes session started"
        );
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
        // cancelling stops the watcher or aborts an in-flight create,
        // which then sweeps any objects this delete's own sweep misses
        if let Some(cancel) = self.watchers.lock().await.remove(&id) {
            cancel.cancel();
        }

        let errors = match tokio::time::timeout(
            self.config.pod_stop_timeout(),
            self.delete_objects(id),
        )
        .await
        {
            Ok(errors) => errors,
            Err(_) => vec![format!(
                "object deletion exceeded {}s",
                self.config.pod_stop_timeout_secs
            )],
        };

        // The registry entry goes regardless; object errors surface after
        self.registry.remove(id).await;

        if errors.is_empty() {
            tracing::info!(session_id = %id, "kubernetes session deleted");
            Ok(())
        } else {
            Err(SessionError::BackendStopFailed {
                session_id: id,
                backend: BackendKind::Kubernetes,
                source: anyhow::anyhow!(errors.join("; ")),
            })
        }
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), SessionError> {
        let ids = self.registry.ids().await;
        let deletes = ids.iter().map(|&id| self.delete(id));

        match tokio::time::timeout(timeout, futures::future::join_all(deletes)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "session delete failed during shutdown");
                    }
                }
            }
            Err(_) => {
                tracing::warn!("shutdown deadline elapsed before all deletes finished");
            }
        }

        let remaining = self.registry.len().await;
        if remaining == 0 {
            Ok(())
        } else {
            Err(SessionError::ShutdownIncomplete { remaining })
        }
    }
}

/// Poll the session's Deployment until it becomes ready, times out, or
/// disappears; inspect pods for terminal container failures.
async fn watch_session(
    client: Client,
    registry: Arc<SessionRegistry>,
    watchers: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    config: KubernetesSessionConfig,
    id: Uuid,
    cancel: CancellationToken,
) {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &config.namespace);
    let pods: Api<Pod> = Api::namespaced(client, &config.namespace);
    let name = deployment_name(id);
    let started = tokio::time::Instant::now();
    let mut poll = STARTUP_POLL;
    let mut was_ready = false;
    let mut timed_out = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(poll) => {}
        }

        let deployment = match deployments.get(&name).await {
            Ok(d) => d,
            Err(e) if is_not_found(&e) => {
                tracing::info!(session_id = %id, "deployment gone, marking session stopped");
                registry
                    .update(id, |s| s.set_status(SessionStatus::Stopped))
                    .await;
                registry.remove(id).await;
                break;
            }
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "deployment poll failed");
                continue;
            }
        };

        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0)
            >= 1;

        if ready {
            if !was_ready {
                tracing::info!(session_id = %id, "worker ready");
                poll = STEADY_POLL;
                was_ready = true;
            }
            registry
                .update(id, |s| {
                    if s.status != SessionStatus::Active {
                        s.set_status(SessionStatus::Active);
                        s.error_message = None;
                    }
                })
                .await;
            continue;
        }

        // Not ready: look for terminal container states first
        if let Some(reason) = inspect_pod_failure(&pods, id).await {
            tracing::warn!(session_id = %id, reason = %reason, "session pod failing");
            registry.update(id, |s| s.set_error(reason.clone())).await;
            continue;
        }

        // Objects exist but nothing serves yet
        registry
            .update(id, |s| {
                if s.status == SessionStatus::Creating {
                    s.set_status(SessionStatus::Starting);
                }
            })
            .await;

        if was_ready {
            registry
                .update(id, |s| {
                    if s.status == SessionStatus::Active {
                        s.set_status(SessionStatus::Unhealthy);
                    }
                })
                .await;
        } else if !timed_out && started.elapsed() >= config.pod_start_timeout() {
            tracing::warn!(
                session_id = %id,
                timeout_secs = config.pod_start_timeout_secs,
                "worker never became ready"
            );
            registry
                .update(id, |s| {
                    s.set_status(SessionStatus::Timeout);
                    s.error_message = Some(format!(
                        "pod not ready within {}s",
                        config.pod_start_timeout_secs
                    ));
                })
                .await;
            timed_out = true;
            poll = STEADY_POLL;
        }
    }

    watchers.lock().await.remove(&id);
}

/// Waiting reasons that mark a container as failed. `PodInitializing` is a
/// normal transient state, not an error.
const FAILURE_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
];

/// Scan the session's pods for failed containers; returns a descriptive
/// message for the first one found.
async fn inspect_pod_failure(pods: &Api<Pod>, id: Uuid) -> Option<String> {
    let lp = ListParams::default().labels(&format!("{SESSION_ID_LABEL}={id}"));
    let list = pods.list(&lp).await.ok()?;

    for pod in list {
        let Some(status) = pod.status else { continue };

        let containers = status
            .init_container_statuses
            .iter()
            .flatten()
            .map(|cs| (cs, "Init container"))
            .chain(
                status
                    .container_statuses
                    .iter()
                    .flatten()
                    .map(|cs| (cs, "Container")),
            );

        for (cs, kind) in containers {
            if let Some(ref state) = cs.state {
                if let Some(ref waiting) = state.waiting {
                    if let Some(ref reason) = waiting.reason {
                        if FAILURE_WAITING_REASONS.contains(&reason.as_str()) {
                            return Some(format!("{kind} '{}' failed: {reason}", cs.name));
                        }
                    }
                }
                if let Some(ref terminated) = state.terminated {
                    if terminated.exit_code != 0 {
                        return Some(format!(
                            "{kind} '{}' exited with code {}",
                            cs.name, terminated.exit_code
                        ));
                    }
                }
            }
        }
    }

    None
}

/// Pure object-spec construction, separated for testability.
mod spec {
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
        PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
        PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretVolumeSource,
        Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    use crate::backends::launch;
    use crate::config::KubernetesSessionConfig;
    use crate::core::Session;

    /// Label selecting every object of one session.
    pub const SESSION_ID_LABEL: &str = "agentapi.proxy/session-id";

    const USER_ID_LABEL: &str = "agentapi.proxy/user-id";
    const TAG_LABEL_PREFIX: &str = "agentapi.proxy/tag-";

    /// Deployment name for a session.
    #[must_use]
    pub fn deployment_name(id: Uuid) -> String {
        format!("agentapi-session-{id}")
    }

    /// PVC name for a session.
    #[must_use]
    pub fn pvc_name(id: Uuid) -> String {
        format!("agentapi-session-{id}-pvc")
    }

    /// Service name for a session.
    #[must_use]
    pub fn service_name(id: Uuid) -> String {
        format!("agentapi-session-{id}-svc")
    }

    /// Initial-message Secret name for a session.
    #[must_use]
    pub fn secret_name(id: Uuid) -> String {
        format!("{}-initial-message", service_name(id))
    }

    /// Force a string into `^[A-Za-z0-9_.\-]{1,63}$` with alphanumeric
    /// ends; returns None when nothing survives.
    pub(super) fn sanitize_label(value: &str) -> Option<String> {
        let mapped: String = value
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .take(63)
            .collect();
        let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    }

    /// Labels applied to every object of a session.
    pub(super) fn labels(session: &Session) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/name".to_owned(),
            "agentapi-session".to_owned(),
        );
        labels.insert(
            "app.kubernetes.io/instance".to_owned(),
            deployment_name(session.id),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_owned(),
            "corral".to_owned(),
        );
        labels.insert(SESSION_ID_LABEL.to_owned(), session.id.to_string());
        if let Some(user) = sanitize_label(&session.owner_user_id) {
            labels.insert(USER_ID_LABEL.to_owned(), user);
        }
        for (key, value) in &session.tags {
            let (Some(mut key), Some(value)) = (sanitize_label(key), sanitize_label(value)) else {
                continue;
            };
            // The label name after the prefix is capped at 63 chars, and
            // "tag-" takes four of them
            key.truncate(63 - "tag-".len());
            let key = key.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
            if key.is_empty() {
                continue;
            }
            labels.insert(format!("{TAG_LABEL_PREFIX}{key}"), value);
        }
        labels
    }

    /// Selector labels binding pods to the session's Service.
    fn selector_labels(id: Uuid) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(SESSION_ID_LABEL.to_owned(), id.to_string());
        labels
    }

    /// Per-session workspace PVC.
    pub(super) fn build_pvc(
        config: &KubernetesSessionConfig,
        session: &Session,
    ) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert(
            "storage".to_owned(),
            Quantity(config.pvc_storage_size.clone()),
        );

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(pvc_name(session.id)),
                namespace: Some(config.namespace.clone()),
                labels: Some(labels(session)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                storage_class_name: config.pvc_storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Secret holding the initial message for the sidecar.
    pub(super) fn build_initial_message_secret(
        config: &KubernetesSessionConfig,
        session: &Session,
        message: &str,
    ) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("message".to_owned(), message.to_owned());

        Secret {
            metadata: ObjectMeta {
                name: Some(secret_name(session.id)),
                namespace: Some(config.namespace.clone()),
                labels: Some(labels(session)),
                ..Default::default()
            },
            string_data: Some(data),
            ..Default::default()
        }
    }

    /// ClusterIP Service exposing the worker port.
    pub(super) fn build_service(config: &KubernetesSessionConfig, session: &Session) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(service_name(session.id)),
                namespace: Some(config.namespace.clone()),
                labels: Some(labels(session)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                selector: Some(selector_labels(session.id)),
                ports: Some(vec![ServicePort {
                    port: i32::from(config.base_port),
                    target_port: Some(IntOrString::Int(i32::from(config.base_port))),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn http_probe(port: u16, period_seconds: i32) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_owned()),
                port: IntOrString::Int(i32::from(port)),
                ..Default::default()
            }),
            period_seconds: Some(period_seconds),
            ..Default::default()
        }
    }

    /// Shell script for the initial-message sidecar. Idempotent across pod
    /// restarts via a marker file on the state volume.
    fn sidecar_script(port: u16) -> String {
        format!(
            r#"set -e
STATE=/var/run/agentapi/state/delivered
MESSAGE=/var/run/agentapi/initial-message/message
if [ -f "$STATE" ]; then
  echo "initial message already delivered"
  exit 0
fi
until curl -fsS "http://127.0.0.1:{port}/health" >/dev/null 2>&1; do
  sleep 2
done
content=$(sed -e 's/\\/\\\\/g' -e 's/"/\\"/g' "$MESSAGE" | awk 'NR>1{{printf "\\n"}} {{printf "%s", $0}}')
curl -fsS -X POST -H "Content-Type: application/json" \
  --data "{{\"type\":\"user\",\"content\":\"$content\"}}" \
  "http://127.0.0.1:{port}/message"
touch "$STATE"
"#
        )
    }

    /// Worker-shape options derived from the session's request.
    #[derive(Debug, Clone, Default)]
    pub(super) struct WorkerOptions {
        /// Add the initial-message sidecar and its volumes
        pub with_message_sidecar: bool,

        /// Clone this URL into the workspace via an init container
        pub clone_url: Option<String>,

        /// GitHub token for the clone and the worker environment
        pub github_token: Option<String>,
    }

    /// Init-container script: clone once into the (persistent) workspace.
    fn clone_script() -> String {
        r#"set -e
cd /workspace
if [ ! -d .git ]; then
  git clone "$GIT_REMOTE_URL" .
else
  echo "repository already cloned"
fi
"#
        .to_owned()
    }

    /// Single-replica Deployment running the worker, an optional
    /// `clone-repo` init container, and the message sidecar when the
    /// session has an initial message.
    pub(super) fn build_deployment(
        config: &KubernetesSessionConfig,
        session: &Session,
        options: WorkerOptions,
    ) -> Deployment {
        let port = config.base_port;

        let mut env: Vec<EnvVar> = session
            .environment
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();
        env.sort_by(|a, b| a.name.cmp(&b.name));
        env.push(EnvVar {
            name: "AGENTAPI_SESSION_ID".to_owned(),
            value: Some(session.id.to_string()),
            ..Default::default()
        });
        if let Some(ref token) = options.github_token {
            env.push(EnvVar {
                name: "GITHUB_TOKEN".to_owned(),
                value: Some(token.clone()),
                ..Default::default()
            });
        }

        let mut requests = BTreeMap::new();
        let mut limits = BTreeMap::new();
        requests.insert("cpu".to_owned(), Quantity(config.cpu_request.clone()));
        requests.insert("memory".to_owned(), Quantity(config.memory_request.clone()));
        limits.insert("cpu".to_owned(), Quantity(config.cpu_limit.clone()));
        limits.insert("memory".to_owned(), Quantity(config.memory_limit.clone()));

        let worker = Container {
            name: "agentapi".to_owned(),
            image: Some(config.image.clone()),
            image_pull_policy: Some(config.image_pull_policy.clone()),
            args: Some(launch::worker_args(port)),
            working_dir: Some("/workspace".to_owned()),
            ports: Some(vec![ContainerPort {
                container_port: i32::from(port),
                ..Default::default()
            }]),
            env: Some(env),
            volume_mounts: Some(vec![VolumeMount {
                name: "workspace".to_owned(),
                mount_path: "/workspace".to_owned(),
                ..Default::default()
            }]),
            readiness_probe: Some(http_probe(port, 5)),
            liveness_probe: Some(http_probe(port, 30)),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut containers = vec![worker];
        let mut volumes = vec![Volume {
            name: "workspace".to_owned(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(session.id),
                ..Default::default()
            }),
            ..Default::default()
        }];

        let init_containers = options.clone_url.as_ref().map(|url| {
            let mut clone_env = vec![EnvVar {
                name: "GIT_REMOTE_URL".to_owned(),
                value: Some(url.clone()),
                ..Default::default()
            }];
            if let Some(ref token) = options.github_token {
                clone_env.push(EnvVar {
                    name: "GITHUB_TOKEN".to_owned(),
                    value: Some(token.clone()),
                    ..Default::default()
                });
            }
            vec![Container {
                name: "clone-repo".to_owned(),
                image: Some("alpine/git:latest".to_owned()),
                command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
                args: Some(vec![clone_script()]),
                env: Some(clone_env),
                volume_mounts: Some(vec![VolumeMount {
                    name: "workspace".to_owned(),
                    mount_path: "/workspace".to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]
        });

        if options.with_message_sidecar {
            containers.push(Container {
                name: "initial-message".to_owned(),
                image: Some("curlimages/curl:latest".to_owned()),
                command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
                args: Some(vec![sidecar_script(port)]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "initial-message".to_owned(),
                        mount_path: "/var/run/agentapi/initial-message".to_owned(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "message-state".to_owned(),
                        mount_path: "/var/run/agentapi/state".to_owned(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            });
            volumes.push(Volume {
                name: "initial-message".to_owned(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name(session.id)),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volumes.push(Volume {
                name: "message-state".to_owned(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        Deployment {
            metadata: ObjectMeta {
                name: Some(deployment_name(session.id)),
                namespace: Some(config.namespace.clone()),
                labels: Some(labels(session)),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(session.id)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels(session)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(config.service_account.clone()),
                        init_containers,
                        containers,
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::session::SessionSeed;
        use crate::core::{Scope, SessionStatus, StartRequest};
        use std::collections::HashMap;

        fn session_with_tags(tags: &[(&str, &str)]) -> Session {
            let mut request = StartRequest::default();
            for (k, v) in tags {
                request.tags.insert((*k).to_owned(), (*v).to_owned());
            }
            Session::new(SessionSeed {
                id: Uuid::new_v4(),
                owner_user_id: "alice@example.com".to_owned(),
                scope: Scope::User,
                team_id: None,
                addr: "unused".to_owned(),
                status: SessionStatus::Creating,
                environment: HashMap::new(),
                request,
            })
        }

        fn config() -> KubernetesSessionConfig {
            KubernetesSessionConfig {
                enabled: true,
                namespace: "agents".to_owned(),
                ..Default::default()
            }
        }

        fn assert_label_shape(labels: &BTreeMap<String, String>) {
            for (key, value) in labels {
                let name = key.rsplit('/').next().unwrap_or(key);
                assert!(
                    (1..=63).contains(&name.len()),
                    "label name {name:?} out of bounds"
                );
                assert!(
                    (1..=63).contains(&value.len()),
                    "label value {value:?} out of bounds"
                );
                assert!(
                    value
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')),
                    "label value {value:?} has invalid characters"
                );
            }
        }

        #[test]
        fn object_names_follow_the_contract() {
            let id = Uuid::new_v4();
            assert_eq!(deployment_name(id), format!("agentapi-session-{id}"));
            assert_eq!(pvc_name(id), format!("agentapi-session-{id}-pvc"));
            assert_eq!(service_name(id), format!("agentapi-session-{id}-svc"));
            assert_eq!(
                secret_name(id),
                format!("agentapi-session-{id}-svc-initial-message")
            );
        }

        #[test]
        fn sanitize_label_conforms() {
            assert_eq!(sanitize_label("alice@example.com").as_deref(), Some("alice-example.com"));
            assert_eq!(sanitize_label("-trim-me-").as_deref(), Some("trim-me"));
            assert_eq!(sanitize_label("ok_name.1").as_deref(), Some("ok_name.1"));
            assert_eq!(sanitize_label("@@@"), None);
            assert_eq!(sanitize_label(""), None);
            let long = "x".repeat(100);
            assert_eq!(sanitize_label(&long).map(|s| s.len()), Some(63));
        }

        #[test]
        fn labels_cover_user_and_tags() {
            let session = session_with_tags(&[("env", "prod"), ("bad key!", "bad value!")]);
            let labels = labels(&session);
            assert_eq!(labels[SESSION_ID_LABEL], session.id.to_string());
            assert_eq!(labels[USER_ID_LABEL], "alice-example.com");
            assert_eq!(labels["agentapi.proxy/tag-env"], "prod");
            assert_eq!(labels["agentapi.proxy/tag-bad-key"], "bad-value");
            assert_label_shape(&labels);
        }

        #[test]
        fn deployment_shape() {
            let session = session_with_tags(&[]);
            let deployment = build_deployment(&config(), &session, WorkerOptions::default());
            let spec = deployment.spec.unwrap();
            assert_eq!(spec.replicas, Some(1));
            assert_eq!(
                spec.selector.match_labels.unwrap()[SESSION_ID_LABEL],
                session.id.to_string()
            );
            let pod = spec.template.spec.unwrap();
            assert_eq!(pod.containers.len(), 1);
            let worker = &pod.containers[0];
            assert_eq!(worker.name, "agentapi");
            let probe = worker.readiness_probe.as_ref().unwrap();
            assert_eq!(
                probe.http_get.as_ref().unwrap().path.as_deref(),
                Some("/health")
            );
            let args = worker.args.as_ref().unwrap();
            assert_eq!(args[0], "server");
            assert_eq!(args[1], "--port");
        }

        #[test]
        fn deployment_with_sidecar_mounts_the_secret() {
            let session = session_with_tags(&[]);
            let deployment = build_deployment(
                &config(),
                &session,
                WorkerOptions {
                    with_message_sidecar: true,
                    ..Default::default()
                },
            );
            let pod = deployment.spec.unwrap().template.spec.unwrap();
            assert_eq!(pod.containers.len(), 2);
            assert_eq!(pod.containers[1].name, "initial-message");
            let volumes = pod.volumes.unwrap();
            assert!(volumes.iter().any(|v| v
                .secret
                .as_ref()
                .is_some_and(|s| s.secret_name.as_deref()
                    == Some(secret_name(session.id).as_str()))));
            assert!(volumes.iter().any(|v| v.empty_dir.is_some()));
        }

        #[test]
        fn deployment_with_repo_gets_a_clone_init_container() {
            let session = session_with_tags(&[]);
            let deployment = build_deployment(
                &config(),
                &session,
                WorkerOptions {
                    clone_url: Some("https://github.com/coder/agentapi.git".to_owned()),
                    github_token: Some("tok".to_owned()),
                    ..Default::default()
                },
            );
            let pod = deployment.spec.unwrap().template.spec.unwrap();
            let init = pod.init_containers.unwrap();
            assert_eq!(init.len(), 1);
            assert_eq!(init[0].name, "clone-repo");
            let env = init[0].env.as_ref().unwrap();
            assert!(env
                .iter()
                .any(|e| e.name == "GIT_REMOTE_URL"
                    && e.value.as_deref() == Some("https://github.com/coder/agentapi.git")));
            assert!(env.iter().any(|e| e.name == "GITHUB_TOKEN"));

            // The worker itself carries the token too
            let worker_env = pod.containers[0].env.as_ref().unwrap();
            assert!(worker_env.iter().any(|e| e.name == "GITHUB_TOKEN"));
        }

        #[test]
        fn service_selects_the_session() {
            let session = session_with_tags(&[]);
            let service = build_service(&config(), &session);
            let spec = service.spec.unwrap();
            assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
            assert_eq!(
                spec.selector.unwrap()[SESSION_ID_LABEL],
                session.id.to_string()
            );
        }

        #[test]
        fn pvc_requests_configured_storage() {
            let session = session_with_tags(&[]);
            let pvc = build_pvc(&config(), &session);
            let spec = pvc.spec.unwrap();
            assert_eq!(
                spec.access_modes.as_deref(),
                Some(&["ReadWriteOnce".to_owned()][..])
            );
            let requests = spec.resources.unwrap().requests.unwrap();
            assert_eq!(requests["storage"].0, "5Gi");
        }

        #[test]
        fn secret_carries_the_message() {
            let session = session_with_tags(&[]);
            let secret = build_initial_message_secret(&config(), &session, "hello worker");
            assert_eq!(secret.string_data.unwrap()["message"], "hello worker");
        }

        proptest::proptest! {
            #[test]
            fn sanitized_labels_always_conform(input in ".*") {
                if let Some(out) = sanitize_label(&input) {
                    proptest::prop_assert!((1..=63).contains(&out.len()));
                    proptest::prop_assert!(out
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
                    let first = out.chars().next().unwrap();
                    let last = out.chars().last().unwrap();
                    proptest::prop_assert!(first.is_ascii_alphanumeric());
                    proptest::prop_assert!(last.is_ascii_alphanumeric());
                }
            }
        }
    }
}
