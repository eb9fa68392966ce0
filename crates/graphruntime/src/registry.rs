use crate::RegistryError;
use graphcore::{GraphNode, Operation, OperationDescriptor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Metadata about an operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetadata {
    pub description: String,
    pub category: String,
}

impl Default for OperationMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

impl OperationMetadata {
    pub fn new(category: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
        }
    }
}

struct Registered {
    operation: Arc<Operation>,
    metadata: OperationMetadata,
}

/// Operations available to graph builders, looked up by name
pub struct OperationRegistry {
    operations: HashMap<String, Registered>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Register an operation under its descriptor name
    pub fn register(&mut self, operation: Operation) -> Result<Arc<Operation>, RegistryError> {
        self.register_with(operation, OperationMetadata::default())
    }

    pub fn register_with(
        &mut self,
        operation: Operation,
        metadata: OperationMetadata,
    ) -> Result<Arc<Operation>, RegistryError> {
        let name = operation.name().to_string();
        if self.operations.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        tracing::debug!("Registering operation: {} ({})", name, operation.executable_name());
        let operation = Arc::new(operation);
        self.operations.insert(
            name,
            Registered {
                operation: operation.clone(),
                metadata,
            },
        );
        Ok(operation)
    }

    pub fn operation(&self, name: &str) -> Result<Arc<Operation>, RegistryError> {
        self.operations
            .get(name)
            .map(|registered| registered.operation.clone())
            .ok_or_else(|| RegistryError::UnknownOperation(name.to_string()))
    }

    /// Create an unbound node running operation `name`
    pub fn create_node(&self, name: &str) -> Result<GraphNode, RegistryError> {
        Ok(GraphNode::new(self.operation(name)?))
    }

    pub fn descriptor(&self, name: &str) -> Result<&OperationDescriptor, RegistryError> {
        self.operations
            .get(name)
            .map(|registered| registered.operation.descriptor())
            .ok_or_else(|| RegistryError::UnknownOperation(name.to_string()))
    }

    pub fn metadata(&self, name: &str) -> Option<&OperationMetadata> {
        self.operations.get(name).map(|registered| &registered.metadata)
    }

    /// All registered operation names, sorted
    pub fn list_operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
