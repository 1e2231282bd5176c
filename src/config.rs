use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Local backend settings
    pub local: LocalConfig,

    /// Per-role env file settings
    pub role_env_files: RoleEnvFiles,

    /// Kubernetes backend settings
    pub kubernetes_session: KubernetesSessionConfig,

    /// Authentication settings
    pub auth: AuthConfig,

    /// Share link settings
    pub share: ShareConfig,

    /// Monitor and reaper cadence
    pub monitor: MonitorConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener
    pub bind_addr: String,

    /// Bind port for the HTTP listener
    pub port: u16,

    /// Origins allowed by CORS ("*" for any)
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_owned(),
            port: 8080,
            allowed_origins: vec!["*".to_owned()],
        }
    }
}

/// Settings for the local (process-per-session) backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// First port handed to a worker; the allocator advances from here
    pub start_port: u16,

    /// Root directory under which each session gets a working directory
    pub workdir_root: PathBuf,

    /// Worker binary name
    pub agentapi_bin: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        let workdir_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".corral/sessions");
        Self {
            start_port: 9000,
            workdir_root,
            agentapi_bin: "agentapi".to_owned(),
        }
    }
}

/// Per-role env file settings (lowest-precedence env layer).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoleEnvFiles {
    /// Load `<path>/<role>.env` when the caller has a role
    pub enabled: bool,

    /// Directory containing `<role>.env` files
    pub path: PathBuf,
}

/// Settings for the Kubernetes backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSessionConfig {
    /// Back sessions with Kubernetes Deployments instead of local processes
    pub enabled: bool,

    /// Namespace for session objects
    pub namespace: String,

    /// Worker container image
    pub image: String,

    /// Image pull policy (e.g. "IfNotPresent")
    pub image_pull_policy: String,

    /// Service account for session pods
    pub service_account: String,

    /// Worker port inside the pod; also the Service port
    pub base_port: u16,

    /// CPU request (e.g. "500m")
    pub cpu_request: String,

    /// CPU limit (e.g. "2000m")
    pub cpu_limit: String,

    /// Memory request (e.g. "512Mi")
    pub memory_request: String,

    /// Memory limit (e.g. "2Gi")
    pub memory_limit: String,

    /// Storage class for workspace PVCs (None = cluster default)
    pub pvc_storage_class: Option<String>,

    /// Size of the workspace PVC
    pub pvc_storage_size: String,

    /// Seconds to wait for the pod to become ready
    pub pod_start_timeout_secs: u64,

    /// Seconds allotted to object deletion on session stop
    pub pod_stop_timeout_secs: u64,
}

impl Default for KubernetesSessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "default".to_owned(),
            image: "ghcr.io/coder/agentapi:latest".to_owned(),
            image_pull_policy: "IfNotPresent".to_owned(),
            service_account: "default".to_owned(),
            base_port: 3284,
            cpu_request: "500m".to_owned(),
            cpu_limit: "2000m".to_owned(),
            memory_request: "512Mi".to_owned(),
            memory_limit: "2Gi".to_owned(),
            pvc_storage_class: None,
            pvc_storage_size: "5Gi".to_owned(),
            pod_start_timeout_secs: 300,
            pod_stop_timeout_secs: 60,
        }
    }
}

impl KubernetesSessionConfig {
    /// Deadline for the readiness watcher.
    pub fn pod_start_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_start_timeout_secs)
    }

    /// Deadline for object deletion on session stop.
    pub fn pod_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_stop_timeout_secs)
    }
}

/// Authentication settings. The concrete provider is injected; this only
/// decides whether unauthenticated requests are rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Require an authenticated caller on every session route
    pub enabled: bool,
}

/// Share link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Expose the share routes
    pub enabled: bool,

    /// Lifetime of a share token in seconds
    pub ttl_secs: u64,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl ShareConfig {
    /// Lifetime of a share token.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Monitor and reaper cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between monitor sweeps
    pub check_interval_secs: u64,

    /// Seconds between reaper sweeps
    pub reaper_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 180,
            reaper_interval_secs: 300,
        }
    }
}

impl MonitorConfig {
    /// Interval between monitor sweeps.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Interval between reaper sweeps.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from the given path, or fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(p) if p.exists() => match Self::load(p) {
                Ok(c) => return c,
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "failed to load config, using defaults");
                    Self::default()
                }
            },
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config
    }

    /// Apply environment-variable overrides documented in the CLI help.
    fn apply_env_overrides(&mut self) {
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            let origins: Vec<String> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            if !origins.is_empty() {
                self.server.allowed_origins = origins;
            }
        }
    }
}
