//! Defunct-process accounting for the local backend.
//!
//! Supervisors are responsible for reaping their workers; this task only
//! surveys the host process table and raises a warning when zombies
//! accumulate, which would indicate a supervisor bug.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Zombie count above which the sweep logs at warn level.
const ZOMBIE_WARN_THRESHOLD: usize = 10;

/// Run `ps aux` sweeps until cancelled.
pub async fn run(interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("reaper stopped");
                break;
            }
            _ = ticker.tick() => sweep().await,
        }
    }
}

/// One sweep: count defunct entries and probe their accessibility.
async fn sweep() {
    let output = match tokio::process::Command::new("ps").arg("aux").output().await {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::debug!(status = %output.status, "ps aux failed");
            return;
        }
        Err(e) => {
            tracing::debug!(error = %e, "could not run ps");
            return;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let zombies = count_zombies(&stdout);

    let mut accessible = 0usize;
    for pid in &zombies {
        // Signal 0 probes existence/permission without delivering anything
        if kill(Pid::from_raw(*pid), None).is_ok() {
            accessible += 1;
        }
    }

    if zombies.len() > ZOMBIE_WARN_THRESHOLD {
        tracing::warn!(
            count = zombies.len(),
            accessible,
            "zombie processes accumulating"
        );
    } else if !zombies.is_empty() {
        tracing::info!(count = zombies.len(), accessible, "defunct processes present");
    } else {
        tracing::debug!("no defunct processes");
    }
}

/// Extract the PIDs of defunct entries from `ps aux` output.
///
/// A zombie shows `Z` in the STAT column (8th) or `<defunct>` in the
/// command.
fn count_zombies(ps_output: &str) -> Vec<i32> {
    let mut pids = Vec::new();
    for line in ps_output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 11 {
            continue;
        }
        let is_zombie = fields[7].starts_with('Z') || line.contains("<defunct>");
        if !is_zombie {
            continue;
        }
        if let Ok(pid) = fields[1].parse::<i32>() {
            pids.push(pid);
        }
    }
    pids
}

/// Reaper handle: spawn on an interval with a cancel token.
#[derive(Debug)]
pub struct Reaper;

impl Reaper {
    /// Spawn the reaper task.
    pub fn spawn(interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run(interval, cancel))
    }
}
