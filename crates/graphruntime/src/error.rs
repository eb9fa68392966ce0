use graphcore::GraphError;
use std::sync::Arc;
use thiserror::Error;

/// Terminal failure of a scheduler entry, or of the pipeline as a whole.
///
/// Clone so every waiter on an entry observes the same failure.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("Scheduler requires a running tokio runtime")]
    NoRuntime,

    #[error("Pipeline was joined before it was started")]
    NotStarted,

    #[error("Entry {entry} failed: {source}")]
    EntryFailed {
        entry: String,
        #[source]
        source: Arc<GraphError>,
    },

    #[error("Entry {entry} did not run: dependency {dependency} failed")]
    DependencyFailed { entry: String, dependency: String },

    #[error("Entry {entry} was discarded by a reset before it started")]
    Discarded { entry: String },

    #[error("Unknown entry: {0}")]
    UnknownEntry(String),

    #[error("{failed} pipeline entries failed; first: {first}")]
    PipelineFailed {
        failed: usize,
        first: Box<SchedulerError>,
    },

    #[error("Entry {entry} panicked: {message}")]
    Panicked { entry: String, message: String },
}

impl SchedulerError {
    /// The graph error behind this failure, if a task produced one.
    pub fn graph_error(&self) -> Option<&GraphError> {
        match self {
            SchedulerError::EntryFailed { source, .. } => Some(source),
            SchedulerError::PipelineFailed { first, .. } => first.graph_error(),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation already registered: {0}")]
    Duplicate(String),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}
