use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Events emitted while a pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: RunId,
        entries: usize,
        timestamp: DateTime<Utc>,
    },
    EntryStarted {
        run_id: RunId,
        entry: usize,
        name: String,
        timestamp: DateTime<Utc>,
    },
    EntryCompleted {
        run_id: RunId,
        entry: usize,
        name: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    EntryFailed {
        run_id: RunId,
        entry: usize,
        name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeComputed {
        run_id: RunId,
        node: NodeId,
        operation: String,
        slots: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// An undefined node left uncomputed by a lenient run.
    NodeSkipped {
        run_id: RunId,
        node: NodeId,
        parameter: String,
        timestamp: DateTime<Utc>,
    },
    PipelineDrained {
        run_id: RunId,
        completed: usize,
        failed: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            PipelineEvent::PipelineStarted { run_id, .. }
            | PipelineEvent::EntryStarted { run_id, .. }
            | PipelineEvent::EntryCompleted { run_id, .. }
            | PipelineEvent::EntryFailed { run_id, .. }
            | PipelineEvent::NodeComputed { run_id, .. }
            | PipelineEvent::NodeSkipped { run_id, .. }
            | PipelineEvent::PipelineDrained { run_id, .. } => *run_id,
        }
    }
}

/// Broadcasts pipeline events to any number of listeners. Emitting with no
/// listener is not an error.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
