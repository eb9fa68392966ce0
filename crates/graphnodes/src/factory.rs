use graphcore::{
    Artifact, Arguments, ArtifactType, GraphError, Operation, OperationDescriptor, OperationError, Outputs,
    ParameterSpec, SELF_SLOT,
};
use std::sync::Arc;

/// Builds a factory operation: a free function returning one or more new
/// artifacts.
pub struct FactoryNode {
    descriptor: OperationDescriptor,
}

impl FactoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: OperationDescriptor::new(name),
        }
    }

    pub fn param(mut self, parameter: ParameterSpec) -> Self {
        self.descriptor = self.descriptor.with_parameter(parameter);
        self
    }

    /// Declares a result slot of type `R`.
    pub fn output<R: Artifact>(mut self, slot: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_output(slot, ArtifactType::of::<R>());
        self
    }

    /// A factory with a single `self` result.
    pub fn returns<R, F>(self, f: F) -> Result<Operation, GraphError>
    where
        R: Artifact,
        F: Fn(&Arguments<'_>) -> Result<R, OperationError> + Send + Sync + 'static,
    {
        self.output::<R>(SELF_SLOT)
            .build(move |args: &Arguments<'_>| Ok(Outputs::new().with(SELF_SLOT, f(args)?)))
    }

    /// A factory filling every declared slot itself.
    pub fn build<F>(self, f: F) -> Result<Operation, GraphError>
    where
        F: Fn(&Arguments<'_>) -> Result<Outputs, OperationError> + Send + Sync + 'static,
    {
        Operation::factory(self.descriptor, Arc::new(f))
    }
}
