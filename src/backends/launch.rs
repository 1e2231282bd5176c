//! Worker invocation planning for the local backend.
//!
//! Builds the argv, working directory, and child environment for one
//! worker process, and provisions the workdir (including an optional
//! repository clone) before the spawn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::core::session::tags;

/// Characters that abort extra-arg parsing entirely.
const FORBIDDEN_ARG_CHARS: &[char] = &[
    '|', '&', ';', '(', ')', '<', '>', '`', '$', '\\', '"', '\'',
];

/// A fully planned worker invocation.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Program to execute (the agentapi binary)
    pub program: String,

    /// Arguments, starting with `server --port <P>`
    pub args: Vec<String>,

    /// Per-session working directory
    pub workdir: PathBuf,

    /// Child environment (process ∪ session-home ∪ credentials ∪ session)
    pub env: HashMap<String, String>,
}

/// Inputs to [`prepare`].
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    /// Session identifier (names the workdir)
    pub session_id: Uuid,

    /// Port the worker will serve on
    pub port: u16,

    /// agentapi binary name
    pub agentapi_bin: &'a str,

    /// Root under which session workdirs live
    pub workdir_root: &'a Path,

    /// Final merged session environment
    pub environment: &'a HashMap<String, String>,

    /// Session tags (repository, MCP configs)
    pub tags: &'a HashMap<String, String>,

    /// GitHub token for clone and worker credentials
    pub github_token: Option<&'a str>,
}

/// Plan a worker invocation and provision its working directory.
///
/// A `repository` tag that parses is cloned into the workdir; one that does
/// not parse (or fails to clone) is logged and the session continues
/// without a repo.
///
/// # Errors
///
/// Returns an error only when the working directory cannot be created.
pub async fn prepare(spec: LaunchSpec<'_>) -> anyhow::Result<LaunchPlan> {
    let workdir = spec.workdir_root.join(spec.session_id.to_string());
    tokio::fs::create_dir_all(&workdir).await?;

    if let Some(repo) = spec.tags.get(tags::REPOSITORY) {
        match parse_repo_url(repo) {
            Some(clone_url) => {
                clone_repository(&clone_url, &workdir, spec.github_token).await;
            }
            None => {
                tracing::warn!(session_id = %spec.session_id, repo, "invalid repository URL, continuing without a clone");
            }
        }
    }

    let args = worker_args(spec.port);
    let env = build_child_env(&spec, &workdir);

    Ok(LaunchPlan {
        program: spec.agentapi_bin.to_owned(),
        args,
        workdir,
        env,
    })
}

/// `server --port <P> [agentapi extras] -- sh -c "<claude fallback>"`.
/// Shared by the local spawn and the Kubernetes container spec.
#[must_use]
pub fn worker_args(port: u16) -> Vec<String> {
    let mut args = vec![
        "server".to_owned(),
        "--port".to_owned(),
        port.to_string(),
    ];
    args.extend(extra_args_from_env("AGENTAPI_ARGS"));
    args.push("--".to_owned());
    args.push("sh".to_owned());
    args.push("-c".to_owned());
    args.push(claude_command(&extra_args_from_env("CLAUDE_ARGS")));
    args
}

/// Prefer resuming an existing conversation, fall back to a fresh one.
fn claude_command(claude_args: &[String]) -> String {
    let extras = if claude_args.is_empty() {
        String::new()
    } else {
        format!(" {}", claude_args.join(" "))
    };
    format!("claude -c{extras} || claude{extras}")
}

fn extra_args_from_env(var: &str) -> Vec<String> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => match split_extra_args(&raw) {
            Some(args) => args,
            None => {
                tracing::warn!(var, "extra args contain shell metacharacters, omitting");
                Vec::new()
            }
        },
        _ => Vec::new(),
    }
}

/// Split an extra-args string on whitespace under a strict allow-list.
///
/// Any forbidden character anywhere in the string aborts the parse; tokens
/// outside `^[A-Za-z0-9\-_./=]+$` are dropped individually.
fn split_extra_args(raw: &str) -> Option<Vec<String>> {
    if raw.contains(FORBIDDEN_ARG_CHARS) {
        return None;
    }
    let mut args = Vec::new();
    for token in raw.split_whitespace() {
        if token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '='))
        {
            args.push(token.to_owned());
        } else {
            tracing::warn!(token, "dropping extra arg outside the allow-list");
        }
    }
    Some(args)
}

/// Normalize an accepted repository reference into a clone URL.
///
/// Accepted forms: `https://github.com/owner/repo[.git]`, `http://…`,
/// `git@github.com:owner/repo[.git]`, and bare `owner/repo`.
#[must_use]
pub fn parse_repo_url(repo: &str) -> Option<String> {
    let repo = repo.trim();
    if repo.is_empty() || repo.contains(char::is_whitespace) {
        return None;
    }

    if repo.starts_with("https://") || repo.starts_with("http://") {
        return Some(repo.to_owned());
    }

    if let Some(rest) = repo.strip_prefix("git@github.com:") {
        if is_owner_repo(rest.trim_end_matches(".git")) {
            return Some(repo.to_owned());
        }
        return None;
    }

    // Bare owner/repo
    if is_owner_repo(repo) {
        return Some(format!("https://github.com/{repo}.git"));
    }

    None
}

/// `owner/repo` with exactly one slash and conventional name characters.
fn is_owner_repo(s: &str) -> bool {
    let mut parts = s.splitn(3, '/');
    let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let valid = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid(owner) && valid(name)
}

/// Best-effort `git clone` into the workdir. Failures are logged; the
/// session starts without the repo.
async fn clone_repository(url: &str, workdir: &Path, github_token: Option<&str>) {
    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("clone").arg(url).arg(workdir);
    // A cancelled create drops this future mid-clone; take git down with it
    cmd.kill_on_drop(true);
    if let Some(token) = github_token {
        cmd.env("GITHUB_TOKEN", token);
    }
    match cmd.output().await {
        Ok(output) if output.status.success() => {
            tracing::info!(url, workdir = %workdir.display(), "cloned repository");
        }
        Ok(output) => {
            tracing::warn!(
                url,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "git clone failed, continuing without a repo"
            );
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "could not run git, continuing without a repo");
        }
    }
}

/// Assemble the child environment: process env, session home, credential
/// env, then the session env. Later layers override earlier ones.
fn build_child_env(spec: &LaunchSpec<'_>, workdir: &Path) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    // The session directory doubles as the worker's home
    env.insert("HOME".to_owned(), workdir.display().to_string());

    if let Some(token) = spec.github_token {
        env.insert("GITHUB_TOKEN".to_owned(), token.to_owned());
    }
    if let Ok(api) = std::env::var("GITHUB_API") {
        env.insert("GITHUB_API".to_owned(), api);
    }

    if let Some(mcp) = spec.tags.get(tags::MCP_CONFIGS) {
        env.insert("CLAUDE_MCP_CONFIGS".to_owned(), mcp.clone());
    }

    for (key, value) in spec.environment {
        env.insert(key.clone(), value.clone());
    }

    env
}
