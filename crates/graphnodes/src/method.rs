use graphcore::{
    Artifact, Arguments, ArtifactType, GraphError, Operation, OperationDescriptor, OperationError, Outputs,
    ParameterSpec, EXECUTOR_PARAMETER, SELF_SLOT,
};
use std::marker::PhantomData;
use std::sync::Arc;

/// Builds a method operation on receiver type `T`.
///
/// The receiver is bound through the exclusive `executor` parameter and
/// is always exposed again as the `self` result.
pub struct MethodNode<T> {
    descriptor: OperationDescriptor,
    _receiver: PhantomData<fn() -> T>,
}

impl<T: Artifact> MethodNode<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: OperationDescriptor::new(name)
                .with_parameter(ParameterSpec::exclusive::<T>(EXECUTOR_PARAMETER))
                .with_output(SELF_SLOT, ArtifactType::of::<T>()),
            _receiver: PhantomData,
        }
    }

    pub fn param(mut self, parameter: ParameterSpec) -> Self {
        self.descriptor = self.descriptor.with_parameter(parameter);
        self
    }

    /// A self-returning method: `f` mutates the receiver in place.
    pub fn mutating<F>(self, f: F) -> Result<Operation, GraphError>
    where
        F: Fn(&mut T, &Arguments<'_>) -> Result<(), OperationError> + Send + Sync + 'static,
    {
        Operation::method(
            self.descriptor,
            true,
            Arc::new(move |args: &Arguments<'_>| {
                args.receiver()?.write(|target: &mut T| f(target, args))??;
                Ok(Outputs::new())
            }),
        )
    }

    /// A method allocating a new `R`, exposed under `slot` next to the
    /// (possibly mutated) receiver.
    pub fn allocating<R, F>(self, slot: &str, f: F) -> Result<Operation, GraphError>
    where
        R: Artifact,
        F: Fn(&mut T, &Arguments<'_>) -> Result<R, OperationError> + Send + Sync + 'static,
    {
        let descriptor = self.descriptor.with_output(slot, ArtifactType::of::<R>());
        let slot = slot.to_string();
        Operation::method(
            descriptor,
            false,
            Arc::new(move |args: &Arguments<'_>| {
                let allocated = args.receiver()?.write(|target: &mut T| f(target, args))??;
                Ok(Outputs::new().with(slot.clone(), allocated))
            }),
        )
    }
}
