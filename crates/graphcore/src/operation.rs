use crate::{
    Access, Artifact, ArtifactCell, ArtifactType, GraphError, OperationDescriptor, OperationError,
    ParameterSpec, Snapshot, Value, SELF_SLOT,
};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Invocation closure captured when an operation is defined.
pub type Thunk = Arc<dyn Fn(&Arguments<'_>) -> Result<Outputs, OperationError> + Send + Sync>;

/// Parameter name used by method nodes for their receiver.
pub const EXECUTOR_PARAMETER: &str = "executor";

/// Parameter name of an output node's single input.
pub const OUTPUT_PARAMETER: &str = "input";

/// The closed set of node kinds the engine knows how to run.
#[derive(Clone)]
pub enum NodeKind {
    /// Calls a method on the artifact bound to the exclusive parameter.
    /// The receiver is exposed as the `self` slot; a non self-returning
    /// method additionally exposes the artifacts it allocates.
    Method { self_returning: bool, call: Thunk },
    /// Allocates a new artifact from constructor arguments.
    Constructor { call: Thunk },
    /// Calls a free function returning new artifacts.
    Factory { call: Thunk },
    /// Publishes an artifact supplied from outside the graph.
    Input,
    /// Captures a snapshot of an upstream artifact; has no result slots.
    Output,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Method { .. } => "method",
            NodeKind::Constructor { .. } => "constructor",
            NodeKind::Factory { .. } => "factory",
            NodeKind::Input => "input",
            NodeKind::Output => "output",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Method { self_returning, .. } => f
                .debug_struct("Method")
                .field("self_returning", self_returning)
                .finish_non_exhaustive(),
            other => f.write_str(other.label()),
        }
    }
}

/// An operation descriptor paired with the way to run it.
#[derive(Debug, Clone)]
pub struct Operation {
    descriptor: OperationDescriptor,
    kind: NodeKind,
}

impl Operation {
    /// A method on the artifact bound to the descriptor's exclusive parameter.
    ///
    /// The descriptor must declare exactly one exclusive parameter and a
    /// `self` slot of the same type. A method that is not self-returning
    /// must declare at least one further slot for what it allocates.
    pub fn method(descriptor: OperationDescriptor, self_returning: bool, call: Thunk) -> Result<Self, GraphError> {
        descriptor.validate()?;

        let receiver = descriptor.exclusive_parameter().ok_or_else(|| {
            GraphError::InvalidArgument(format!(
                "method {} declares no exclusive receiver parameter",
                descriptor.name
            ))
        })?;
        let receiver_type = receiver.kind.artifact_type();
        let self_slot = descriptor.output(SELF_SLOT).ok_or_else(|| {
            GraphError::InvalidArgument(format!("method {} declares no '{}' slot", descriptor.name, SELF_SLOT))
        })?;
        if Some(self_slot.ty) != receiver_type {
            return Err(GraphError::InvalidArgument(format!(
                "method {}: receiver '{}' is {:?} but the '{}' slot is {:?}",
                descriptor.name, receiver.name, receiver_type, SELF_SLOT, self_slot.ty
            )));
        }
        if !self_returning && descriptor.outputs.len() < 2 {
            return Err(GraphError::InvalidArgument(format!(
                "method {} allocates a result but declares no slot for it",
                descriptor.name
            )));
        }

        Ok(Self {
            descriptor,
            kind: NodeKind::Method { self_returning, call },
        })
    }

    pub fn constructor(descriptor: OperationDescriptor, call: Thunk) -> Result<Self, GraphError> {
        Self::allocating(descriptor, NodeKind::Constructor { call })
    }

    pub fn factory(descriptor: OperationDescriptor, call: Thunk) -> Result<Self, GraphError> {
        Self::allocating(descriptor, NodeKind::Factory { call })
    }

    fn allocating(descriptor: OperationDescriptor, kind: NodeKind) -> Result<Self, GraphError> {
        descriptor.validate()?;
        if let Some(parameter) = descriptor.exclusive_parameter() {
            return Err(GraphError::InvalidArgument(format!(
                "{} {} cannot take exclusive parameter '{}'",
                kind.label(),
                descriptor.name,
                parameter.name
            )));
        }
        if descriptor.outputs.is_empty() {
            return Err(GraphError::InvalidArgument(format!(
                "{} {} declares no result slot",
                kind.label(),
                descriptor.name
            )));
        }
        Ok(Self { descriptor, kind })
    }

    /// An entry point whose `self` result is injected from outside.
    pub fn input(name: impl Into<String>, ty: ArtifactType) -> Self {
        Self {
            descriptor: OperationDescriptor::new(name).with_output(SELF_SLOT, ty),
            kind: NodeKind::Input,
        }
    }

    /// A sink capturing a snapshot of the artifact bound to `input`.
    pub fn output(name: impl Into<String>, ty: ArtifactType) -> Self {
        Self {
            descriptor: OperationDescriptor::new(name)
                .with_parameter(ParameterSpec::artifact_of(OUTPUT_PARAMETER, ty, Access::Shared)),
            kind: NodeKind::Output,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Human-readable label used in diagnostics.
    pub fn executable_name(&self) -> String {
        let slot_type = |name: &str| {
            self.descriptor
                .output(name)
                .map(|o| o.ty.to_string())
                .unwrap_or_else(|| "?".to_string())
        };

        match &self.kind {
            NodeKind::Method { .. } => {
                let method = self.descriptor.name.rsplit('.').next().unwrap_or(&self.descriptor.name);
                format!("{}.{}", slot_type(SELF_SLOT), method)
            }
            NodeKind::Constructor { .. } => format!("new {}", slot_type(SELF_SLOT)),
            NodeKind::Factory { .. } => format!("{}()", self.descriptor.name),
            NodeKind::Input => format!("input<{}>", slot_type(SELF_SLOT)),
            NodeKind::Output => {
                let ty = self
                    .descriptor
                    .parameters
                    .first()
                    .and_then(|p| p.kind.artifact_type())
                    .map(|ty| ty.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("output<{}>", ty)
            }
        }
    }
}

/// A resolved parameter value.
#[derive(Debug, Clone)]
pub enum Argument {
    Null,
    Value(Value),
    Live(ArtifactCell),
    Shared(Snapshot),
}

impl Argument {
    fn describe(&self) -> String {
        match self {
            Argument::Null => "null".to_string(),
            Argument::Value(value) => value.to_expression(),
            Argument::Live(cell) => format!("<live {}>", cell.artifact_type()),
            Argument::Shared(snapshot) => format!("<{}>", snapshot.artifact_type()),
        }
    }
}

/// Resolved arguments, addressable by declared parameter name.
pub struct Arguments<'a> {
    descriptor: &'a OperationDescriptor,
    values: Vec<Argument>,
}

impl<'a> Arguments<'a> {
    pub fn new(descriptor: &'a OperationDescriptor, values: Vec<Argument>) -> Self {
        Self { descriptor, values }
    }

    pub fn get(&self, name: &str) -> Result<&Argument, OperationError> {
        self.descriptor
            .parameter_index(name)
            .and_then(|index| self.values.get(index))
            .ok_or_else(|| OperationError::MissingArgument(name.to_string()))
    }

    pub fn is_null(&self, name: &str) -> Result<bool, OperationError> {
        Ok(matches!(self.get(name)?, Argument::Null))
    }

    pub fn value(&self, name: &str) -> Result<&Value, OperationError> {
        match self.get(name)? {
            Argument::Value(value) => Ok(value),
            Argument::Null => Err(OperationError::MissingArgument(name.to_string())),
            other => Err(wrong_type(name, "literal", other)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, OperationError> {
        let value = self.value(name)?;
        value.as_f64().ok_or_else(|| wrong_value(name, "float", value))
    }

    pub fn int(&self, name: &str) -> Result<i64, OperationError> {
        let value = self.value(name)?;
        value.as_i64().ok_or_else(|| wrong_value(name, "int", value))
    }

    pub fn bool(&self, name: &str) -> Result<bool, OperationError> {
        let value = self.value(name)?;
        value.as_bool().ok_or_else(|| wrong_value(name, "bool", value))
    }

    pub fn string(&self, name: &str) -> Result<&str, OperationError> {
        let value = self.value(name)?;
        value.as_str().ok_or_else(|| wrong_value(name, "string", value))
    }

    pub fn optional_float(&self, name: &str) -> Result<Option<f64>, OperationError> {
        if self.is_null(name)? {
            return Ok(None);
        }
        self.float(name).map(Some)
    }

    pub fn optional_int(&self, name: &str) -> Result<Option<i64>, OperationError> {
        if self.is_null(name)? {
            return Ok(None);
        }
        self.int(name).map(Some)
    }

    /// Borrows the snapshot bound to a shared artifact parameter.
    pub fn shared<T: Any>(&self, name: &str) -> Result<&T, OperationError> {
        self.optional_shared(name)?
            .ok_or_else(|| OperationError::MissingArgument(name.to_string()))
    }

    pub fn optional_shared<T: Any>(&self, name: &str) -> Result<Option<&T>, OperationError> {
        match self.get(name)? {
            Argument::Null => Ok(None),
            Argument::Shared(snapshot) => snapshot.downcast_ref::<T>().map(Some).ok_or_else(|| {
                OperationError::InvalidArgumentType {
                    field: name.to_string(),
                    expected: std::any::type_name::<T>().to_string(),
                    actual: snapshot.artifact_type().name().to_string(),
                }
            }),
            other => Err(wrong_type(name, "shared artifact", other)),
        }
    }

    /// The live artifact bound to an exclusive parameter.
    pub fn exclusive(&self, name: &str) -> Result<&ArtifactCell, OperationError> {
        match self.get(name)? {
            Argument::Live(cell) => Ok(cell),
            Argument::Null => Err(OperationError::MissingArgument(name.to_string())),
            other => Err(wrong_type(name, "exclusive artifact", other)),
        }
    }

    /// The receiver of a method node.
    pub fn receiver(&self) -> Result<&ArtifactCell, OperationError> {
        let parameter = self
            .descriptor
            .exclusive_parameter()
            .ok_or_else(|| OperationError::MissingArgument(EXECUTOR_PARAMETER.to_string()))?;
        self.exclusive(&parameter.name)
    }

    /// `name=value` pairs for error context.
    pub fn summary(&self) -> String {
        self.descriptor
            .parameters
            .iter()
            .zip(&self.values)
            .map(|(parameter, value)| format!("{}={}", parameter.name, value.describe()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn wrong_type(name: &str, expected: &str, actual: &Argument) -> OperationError {
    OperationError::InvalidArgumentType {
        field: name.to_string(),
        expected: expected.to_string(),
        actual: actual.describe(),
    }
}

fn wrong_value(name: &str, expected: &str, actual: &Value) -> OperationError {
    OperationError::InvalidArgumentType {
        field: name.to_string(),
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}

/// Artifacts returned by an operation, keyed by result slot.
#[derive(Debug, Default)]
pub struct Outputs {
    items: Vec<(String, Box<dyn Artifact>)>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Artifact>(mut self, slot: impl Into<String>, value: T) -> Self {
        let boxed: Box<dyn Artifact> = Box::new(value);
        self.items.push((slot.into(), boxed));
        self
    }

    pub fn insert_boxed(&mut self, slot: impl Into<String>, value: Box<dyn Artifact>) {
        self.items.push((slot.into(), value));
    }

    pub fn take(&mut self, slot: &str) -> Option<Box<dyn Artifact>> {
        let index = self.items.iter().position(|(name, _)| name == slot)?;
        Some(self.items.swap_remove(index).1)
    }

    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
