//! Core abstractions for the generation graph
//!
//! Nodes, result handles, edges and the execution context. Everything here
//! is synchronous; scheduling lives in `graphruntime`.

mod artifact;
mod context;
mod descriptor;
mod edge;
mod error;
mod events;
pub mod expression;
mod handle;
mod node;
mod operation;
mod value;

pub use artifact::{Artifact, ArtifactCell, ArtifactType, Snapshot};
pub use context::{ExecutionContext, NODE_ID_IDENTIFIER};
pub use descriptor::{Access, OperationDescriptor, OutputSpec, ParameterKind, ParameterSpec, SELF_SLOT};
pub use edge::Edge;
pub use error::{ExpressionError, GraphError, OperationError};
pub use events::{EventBus, PipelineEvent, RunId};
pub use handle::ResultHandle;
pub use node::{Binding, GraphNode, NodeId, NodeSummary, ParameterSummary, ParameterValue};
pub use operation::{
    Argument, Arguments, NodeKind, Operation, Outputs, Thunk, EXECUTOR_PARAMETER, OUTPUT_PARAMETER,
};
pub use value::{Value, ValueType};
