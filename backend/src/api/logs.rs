//! Real-time import events via Server-Sent Events (SSE).
//!
//! Every progress snapshot the workers emit goes through one broadcast
//! channel; SSE clients subscribe to it.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::{Progress, SessionStatus};

/// Event kind for client display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Finished,
}

/// A single import event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportEvent {
    pub kind: EventKind,
    pub session_id: Uuid,
    pub progress: Progress,
}

impl ImportEvent {
    pub fn from_progress(progress: &Progress) -> Self {
        let kind = if progress.status.is_terminal() {
            EventKind::Finished
        } else {
            EventKind::Progress
        };
        Self {
            kind,
            session_id: progress.session_id,
            progress: progress.clone(),
        }
    }
}

/// Global event broadcaster
pub static EVENT_BROADCASTER: Lazy<EventBroadcaster> = Lazy::new(EventBroadcaster::new);

/// Broadcasts import events to all connected SSE clients
pub struct EventBroadcaster {
    sender: broadcast::Sender<ImportEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    /// Send an event to all subscribers
    pub fn publish(&self, event: ImportEvent) {
        match event.progress.status {
            SessionStatus::Failed => tracing::warn!(
                session_id = %event.session_id,
                errors = event.progress.totals.errors,
                "Import session failed"
            ),
            _ => tracing::debug!(
                session_id = %event.session_id,
                status = %event.progress.status,
                processed = event.progress.totals.processed_rows,
                total = event.progress.totals.total_rows,
                "Import progress"
            ),
        }

        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress callback that forwards to the global broadcaster.
pub fn publish_progress(progress: &Progress) {
    EVENT_BROADCASTER.publish(ImportEvent::from_progress(progress));
}
