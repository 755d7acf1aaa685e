use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::RunId;
use crate::record::{BusinessKey, RecordId};

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub run_id: RunId,
    pub record_id: RecordId,
    pub business_key: BusinessKey,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(run_id: RunId, record_id: RecordId, business_key: BusinessKey) -> Self {
        Self {
            version: 1,
            // Events of one run share a correlation id derived from the run.
            correlation_id: run_id.as_uuid(),
            run_id,
            record_id,
            business_key,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle event for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn new(meta: EventMeta, payload: RunEventPayload) -> Self {
        Self { meta, payload }
    }

    pub fn run_id(&self) -> RunId {
        self.meta.run_id
    }
}

/// Event payload emitted for run lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    /// The engine accepted the run and the worker was dispatched.
    Launched { job_name: String },
    /// The worker registered and started the long-running work.
    Processing { job_name: String },
    /// A stop was requested for the run.
    StopRequested { engine_accepted: bool },
    /// The work finished successfully.
    Completed { duration_ms: i64 },
    /// The work was cancelled, errored or panicked.
    Failed { reason: String, cancelled: bool },
}

impl RunEventPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEventPayload::Completed { .. } | RunEventPayload::Failed { .. }
        )
    }
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never blocks: events are dropped when nobody listens, and a
/// subscriber that falls behind by more than `capacity` events receives
/// `RecvError::Lagged` instead of slowing the publisher.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event to all current subscribers.
    pub fn publish_run(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to run events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}
