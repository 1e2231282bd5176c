//! Notification sink for session lifecycle events.
//!
//! The dispatcher that fans events out to users is an external
//! collaborator; this trait is the seam it plugs into. The default sink
//! only logs.

use async_trait::async_trait;

/// Receives monitor-detected session events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an event for a user. Implementations must not fail the
    /// caller; delivery problems are theirs to log.
    async fn notify(&self, user_id: &str, event: &str, data: serde_json::Value);
}

/// Sink that records events in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, event: &str, data: serde_json::Value) {
        tracing::info!(user_id, event, %data, "session notification");
    }
}

/// Test sink capturing every event.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: tokio::sync::Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub async fn events(&self) -> Vec<(String, String, serde_json::Value)> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, event: &str, data: serde_json::Value) {
        self.events
            .lock()
            .await
            .push((user_id.to_owned(), event.to_owned(), data));
    }
}
