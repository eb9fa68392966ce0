use graphcore::{Artifact, ArtifactCell, ArtifactType, GraphError, GraphNode, Operation};
use std::marker::PhantomData;
use std::sync::Arc;

/// Entry point publishing a `T` supplied from outside the graph.
pub struct InputNode<T>(PhantomData<fn() -> T>);

impl<T: Artifact> InputNode<T> {
    pub fn operation(name: impl Into<String>) -> Operation {
        Operation::input(name, ArtifactType::of::<T>())
    }

    /// A node of `operation` with `value` already injected.
    pub fn with_value(operation: Arc<Operation>, value: T) -> Result<GraphNode, GraphError> {
        let node = GraphNode::new(operation);
        node.inject(ArtifactCell::new(value))?;
        Ok(node)
    }
}
