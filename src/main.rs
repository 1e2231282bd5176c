use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use corral::api::{build_router, AppState};
use corral::api::share::InMemoryShareRepository;
use corral::auth::HeaderAuthenticator;
use corral::backends::{KubernetesBackend, LocalBackend, SessionBackend};
use corral::config::Config;
use corral::core::SessionRegistry;
use corral::monitor::reaper::Reaper;
use corral::monitor::Monitor;
use corral::notify::LogNotifier;

/// Deadline for draining sessions on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "corral")]
#[command(version)]
#[command(about = "Control plane for agentapi worker sessions")]
#[command(long_about = "\
corral starts one agentapi worker per session, reverse-proxies per-session
HTTP/SSE traffic to it, and terminates the worker on demand. Workers run as
local processes or as Kubernetes Deployments depending on configuration.

ENVIRONMENT VARIABLES:
    RUST_LOG                      Log level filter (default: corral=info)
    ALLOWED_ORIGINS               Comma-separated CORS origins
    GITHUB_TOKEN                  Fallback GitHub token for workers
    GITHUB_PERSONAL_ACCESS_TOKEN  Alternative fallback token
    GITHUB_API                    GitHub API base URL override
    AGENTAPI_ARGS                 Extra args for the worker server command
    CLAUDE_ARGS                   Extra args for the wrapped claude command")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane
    Serve {
        /// Path to the TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the HTTP listen port
        #[arg(long)]
        port: Option<u16>,

        /// Override the HTTP bind address
        #[arg(long, env = "CORRAL_BIND_ADDR")]
        bind_addr: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("corral=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            port,
            bind_addr,
        } => {
            let mut config = Config::load_or_default(config.as_deref());
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind_addr) = bind_addr {
                config.server.bind_addr = bind_addr;
            }
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new());

    let backend: Arc<dyn SessionBackend> = if config.kubernetes_session.enabled {
        tracing::info!(
            namespace = %config.kubernetes_session.namespace,
            image = %config.kubernetes_session.image,
            "using kubernetes session backend"
        );
        Arc::new(
            KubernetesBackend::new(Arc::clone(&registry), config.kubernetes_session.clone())
                .await?,
        )
    } else {
        tracing::info!(
            start_port = config.local.start_port,
            workdir_root = %config.local.workdir_root.display(),
            "using local session backend"
        );
        Arc::new(LocalBackend::new(
            Arc::clone(&registry),
            config.local.clone(),
        ))
    };

    let shares = Arc::new(InMemoryShareRepository::new());
    let authenticator = Arc::new(HeaderAuthenticator::new(config.auth.enabled));
    let notifier = Arc::new(LogNotifier);

    // Background surveillance
    let cancel = CancellationToken::new();
    let monitor = Monitor::new(
        Arc::clone(&registry),
        notifier,
        config.monitor.check_interval(),
    );
    let monitor_task = tokio::spawn(monitor.run(cancel.child_token()));
    let reaper_task = Reaper::spawn(config.monitor.reaper_interval(), cancel.child_token());

    let state = AppState::new(&config, Arc::clone(&backend), registry, shares);
    let app = build_router(state, authenticator, config.share.enabled);

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, draining sessions");
    cancel.cancel();
    if let Err(e) = backend.shutdown(SHUTDOWN_TIMEOUT).await {
        tracing::warn!(error = %e, "session drain incomplete");
    }
    let _ = monitor_task.await;
    let _ = reaper_task.await;

    Ok(())
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
