//! Background session surveillance.
//!
//! One task sweeps the registry on an interval and diffs against its
//! previous snapshot: appearing sessions are logged, vanishing sessions
//! produce `task_completed` notifications, and a worker death observed via
//! status produces a `session_update`. The notifier is pluggable and may
//! be a no-op.

/// Defunct-process accounting.
pub mod reaper;

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{SessionRegistry, SessionStatus};
use crate::notify::Notifier;

/// What the monitor remembers about a session between sweeps.
#[derive(Debug, Clone)]
struct Observed {
    user_id: String,
    status: SessionStatus,
    process_alive: bool,
}

/// Diff-based session monitor.
pub struct Monitor {
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    previous: HashMap<Uuid, Observed>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Create a monitor sweeping at `interval`.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            notifier,
            interval,
            previous: HashMap::new(),
        }
    }

    /// Run sweeps until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("monitor stopped");
                    break;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// One sweep: snapshot, diff, notify, remember.
    pub async fn sweep(&mut self) {
        let current = self.snapshot().await;

        for (id, observed) in &current {
            match self.previous.get(id) {
                None => {
                    tracing::info!(session_id = %id, user_id = %observed.user_id, "new session detected");
                }
                Some(prev) => {
                    if prev.process_alive && !observed.process_alive {
                        self.notifier
                            .notify(
                                &observed.user_id,
                                "session_update",
                                json!({
                                    "session_id": id.to_string(),
                                    "event": "process_terminated",
                                    "status": "process_died",
                                }),
                            )
                            .await;
                    } else if prev.status != observed.status {
                        tracing::info!(
                            session_id = %id,
                            from = %prev.status,
                            to = %observed.status,
                            "session status changed"
                        );
                    }
                }
            }
        }

        // Sessions gone since the last sweep completed (or were terminated)
        let vanished: Vec<(Uuid, Observed)> = self
            .previous
            .iter()
            .filter(|(id, _)| !current.contains_key(id))
            .map(|(id, o)| (*id, o.clone()))
            .collect();
        for (id, last) in vanished {
            let status = if last.process_alive {
                "completed"
            } else {
                "terminated"
            };
            self.notifier
                .notify(
                    &last.user_id,
                    "task_completed",
                    json!({
                        "session_id": id.to_string(),
                        "event": "session_completed",
                        "status": status,
                    }),
                )
                .await;
        }

        self.previous = current;
    }

    /// Snapshot the registry under its read lock. `process_alive` is
    /// derived from status: a session in a terminal status no longer has a
    /// live worker.
    async fn snapshot(&self) -> HashMap<Uuid, Observed> {
        self.registry
            .list(&crate::core::SessionFilter::default())
            .await
            .into_iter()
            .map(|s| {
                (
                    s.id,
                    Observed {
                        user_id: s.owner_user_id,
                        status: s.status,
                        process_alive: !s.status.is_terminal(),
                    },
                )
            })
            .collect()
    }
}
