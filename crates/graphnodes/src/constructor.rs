use graphcore::{
    Artifact, Arguments, ArtifactType, GraphError, Operation, OperationDescriptor, OperationError, Outputs,
    ParameterSpec, SELF_SLOT,
};
use std::marker::PhantomData;
use std::sync::Arc;

/// Builds a constructor operation allocating a `T` from its arguments.
pub struct ConstructorNode<T> {
    descriptor: OperationDescriptor,
    _artifact: PhantomData<fn() -> T>,
}

impl<T: Artifact> ConstructorNode<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: OperationDescriptor::new(name).with_output(SELF_SLOT, ArtifactType::of::<T>()),
            _artifact: PhantomData,
        }
    }

    pub fn param(mut self, parameter: ParameterSpec) -> Self {
        self.descriptor = self.descriptor.with_parameter(parameter);
        self
    }

    pub fn build<F>(self, f: F) -> Result<Operation, GraphError>
    where
        F: Fn(&Arguments<'_>) -> Result<T, OperationError> + Send + Sync + 'static,
    {
        Operation::constructor(
            self.descriptor,
            Arc::new(move |args: &Arguments<'_>| Ok(Outputs::new().with(SELF_SLOT, f(args)?))),
        )
    }
}
