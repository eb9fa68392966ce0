//! Generation runtime
//!
//! The scheduler that runs node computations as dependent entries on a
//! worker pool, the operation registry, and the graph container tying
//! nodes to scheduler entries.

mod error;
mod graph;
mod registry;
mod runtime;
mod scheduler;

pub use error::{RegistryError, RuntimeError, SchedulerError};
pub use graph::{Graph, Schedule};
pub use registry::{OperationMetadata, OperationRegistry};
pub use runtime::{GenerationRuntime, RunSummary, RuntimeConfig};
pub use scheduler::{EntryHandle, EntryState, PipelineReport, Scheduler};
