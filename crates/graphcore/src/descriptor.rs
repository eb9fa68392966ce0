use crate::{ArtifactType, GraphError, Value, ValueType};
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;

/// Name of a node's default result slot: the constructed artifact for
/// constructor/factory/input nodes, the receiver for method nodes.
pub const SELF_SLOT: &str = "self";

/// How an artifact-typed parameter reads its producer's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Access {
    /// Read-only snapshot.
    Shared,
    /// The producer's live artifact; the consumer becomes its only mutator.
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ParameterKind {
    Literal { ty: ValueType },
    Artifact { ty: ArtifactType, access: Access },
}

impl ParameterKind {
    pub fn is_artifact(&self) -> bool {
        matches!(self, ParameterKind::Artifact { .. })
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            ParameterKind::Artifact {
                access: Access::Exclusive,
                ..
            }
        )
    }

    pub fn artifact_type(&self) -> Option<ArtifactType> {
        match self {
            ParameterKind::Artifact { ty, .. } => Some(*ty),
            ParameterKind::Literal { .. } => None,
        }
    }
}

/// A declared operation parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    pub nullable: bool,
    /// Used when a literal parameter is left unbound.
    pub default: Option<Value>,
}

impl ParameterSpec {
    pub fn literal(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Literal { ty },
            nullable: false,
            default: None,
        }
    }

    /// An artifact parameter reading a snapshot of its producer's result.
    pub fn artifact<T: Any>(name: impl Into<String>) -> Self {
        Self::artifact_of(name, ArtifactType::of::<T>(), Access::Shared)
    }

    /// An artifact parameter taking over its producer's live result.
    pub fn exclusive<T: Any>(name: impl Into<String>) -> Self {
        Self::artifact_of(name, ArtifactType::of::<T>(), Access::Exclusive)
    }

    pub fn artifact_of(name: impl Into<String>, ty: ArtifactType, access: Access) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Artifact { ty, access },
            nullable: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A declared result slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSpec {
    pub name: String,
    pub ty: ArtifactType,
}

/// Name, parameters and result slots of an operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub parameters: Vec<ParameterSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, ty: ArtifactType) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// The single exclusive parameter, if any.
    pub fn exclusive_parameter(&self) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.kind.is_exclusive())
    }

    /// Checks names are unique and at most one parameter is exclusive.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.name.trim().is_empty() {
            return Err(GraphError::InvalidArgument(
                "operation name must not be blank".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(GraphError::InvalidArgument(format!(
                    "{}: parameter '{}' declared twice",
                    self.name, parameter.name
                )));
            }
            if let (ParameterKind::Literal { ty }, Some(default)) = (&parameter.kind, &parameter.default) {
                if default.clone().coerce(*ty).is_none() {
                    return Err(GraphError::InvalidArgument(format!(
                        "{}: default {} of parameter '{}' is not a {}",
                        self.name, default, parameter.name, ty
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.name.as_str()) {
                return Err(GraphError::InvalidArgument(format!(
                    "{}: result slot '{}' declared twice",
                    self.name, output.name
                )));
            }
        }

        let exclusive = self.parameters.iter().filter(|p| p.kind.is_exclusive()).count();
        if exclusive > 1 {
            return Err(GraphError::InvalidArgument(format!(
                "{}: {} exclusive parameters declared, at most one is allowed",
                self.name, exclusive
            )));
        }

        Ok(())
    }
}
