use graphcore::{Artifact, ArtifactType, GraphError, GraphNode, Operation};
use std::marker::PhantomData;

/// Sink capturing a snapshot of an upstream `T` for retrieval after the run.
pub struct OutputNode<T>(PhantomData<fn() -> T>);

impl<T: Artifact + Clone> OutputNode<T> {
    pub fn operation(name: impl Into<String>) -> Operation {
        Operation::output(name, ArtifactType::of::<T>())
    }

    /// Copy of what `node` captured.
    pub fn collect(node: &GraphNode) -> Result<T, GraphError> {
        let captured = node.captured()?;
        captured.downcast_ref::<T>().cloned().ok_or_else(|| {
            GraphError::IllegalState(format!(
                "output '{}' captured {} rather than {}",
                node.id(),
                captured.artifact_type(),
                ArtifactType::of::<T>()
            ))
        })
    }
}
