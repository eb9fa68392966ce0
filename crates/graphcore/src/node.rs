use crate::{
    Argument, Arguments, ArtifactCell, ArtifactType, Edge, ExecutionContext, GraphError, NodeKind,
    Operation, OperationError, ParameterKind, ResultHandle, Snapshot, Value, SELF_SLOT,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Stable node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// `<prefix>-<8 hex digits>`
    pub fn generate(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        NodeId(format!("{}-{}", prefix, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId::new(id)
    }
}

/// Current binding of one declared parameter
#[derive(Debug, Clone, Default)]
pub enum Binding {
    #[default]
    Unbound,
    Expression(String),
    Handle(ResultHandle),
}

/// What [`GraphNode::set_parameter`] accepts.
#[derive(Debug, Clone)]
pub enum ParameterValue {
    /// Same as clearing the parameter.
    Null,
    Expression(String),
    /// A typed literal, stored as the expression that evaluates to it.
    Literal(Value),
    Handle(ResultHandle),
}

impl From<&str> for ParameterValue {
    fn from(expression: &str) -> Self {
        ParameterValue::Expression(expression.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(expression: String) -> Self {
        ParameterValue::Expression(expression)
    }
}

impl From<ResultHandle> for ParameterValue {
    fn from(handle: ResultHandle) -> Self {
        ParameterValue::Handle(handle)
    }
}

impl From<Option<ResultHandle>> for ParameterValue {
    fn from(handle: Option<ResultHandle>) -> Self {
        handle.map_or(ParameterValue::Null, ParameterValue::Handle)
    }
}

impl From<Value> for ParameterValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ParameterValue::Null,
            other => ParameterValue::Literal(other),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(n: f64) -> Self {
        Value::Float(n).into()
    }
}

impl From<i64> for ParameterValue {
    fn from(n: i64) -> Self {
        Value::Int(n).into()
    }
}

impl From<bool> for ParameterValue {
    fn from(b: bool) -> Self {
        Value::Bool(b).into()
    }
}

/// Results of one successful computation. Live cells and snapshots are
/// stored together so they can never drift apart.
#[derive(Debug)]
struct ResultSet {
    live: Vec<ArtifactCell>,
    snapshots: Vec<Snapshot>,
    captured: Option<Snapshot>,
}

/// A node of the generation graph: one operation, its parameter bindings
/// and its memoized results.
///
/// Nodes are shared as `Arc<GraphNode>` between the graph, result handles
/// and scheduled tasks, so every method takes `&self`.
pub struct GraphNode {
    id: NodeId,
    operation: Arc<Operation>,
    bindings: RwLock<Vec<Binding>>,
    injected: RwLock<Option<ArtifactCell>>,
    results: RwLock<Option<Arc<ResultSet>>>,
    claim: Mutex<()>,
}

impl GraphNode {
    pub fn new(operation: Arc<Operation>) -> Self {
        let id = NodeId::generate(operation.name());
        Self::with_id(id, operation)
    }

    pub fn with_id(id: impl Into<NodeId>, operation: Arc<Operation>) -> Self {
        let bindings = vec![Binding::Unbound; operation.descriptor().parameters.len()];
        Self {
            id: id.into(),
            operation,
            bindings: RwLock::new(bindings),
            injected: RwLock::new(None),
            results: RwLock::new(None),
            claim: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub fn executable_name(&self) -> String {
        self.operation.executable_name()
    }

    /// Declared type of result slot `slot`.
    pub fn result_class(&self, slot: &str) -> Result<ArtifactType, GraphError> {
        self.operation
            .descriptor()
            .output(slot)
            .map(|output| output.ty)
            .ok_or_else(|| self.unknown("result slot", slot))
    }

    /// Declared kind of parameter `name`.
    pub fn parameter_class(&self, name: &str) -> Result<ParameterKind, GraphError> {
        self.operation
            .descriptor()
            .parameter(name)
            .map(|parameter| parameter.kind.clone())
            .ok_or_else(|| self.unknown("parameter", name))
    }

    /// Names of the declared result slots, in declaration order.
    pub fn result_slots(&self) -> Vec<&str> {
        self.operation
            .descriptor()
            .outputs
            .iter()
            .map(|output| output.name.as_str())
            .collect()
    }

    pub fn parameter(&self, name: &str) -> Result<Binding, GraphError> {
        let index = self.parameter_index(name)?;
        Ok(read(&self.bindings)[index].clone())
    }

    /// Binds parameter `name`.
    ///
    /// `Null` clears the binding. Artifact parameters only accept a handle
    /// whose parameter name matches and whose slot type is the declared
    /// type; literal parameters only accept expressions. An exclusive
    /// parameter already bound to a different producer slot must be cleared
    /// before it can be rebound.
    pub fn set_parameter(&self, name: &str, value: impl Into<ParameterValue>) -> Result<(), GraphError> {
        let index = self.parameter_index(name)?;
        let spec = &self.operation.descriptor().parameters[index];

        let binding = match (value.into(), &spec.kind) {
            (ParameterValue::Null, _) => Binding::Unbound,
            (ParameterValue::Handle(handle), ParameterKind::Artifact { ty, access }) => {
                if handle.parameter() != name {
                    return Err(GraphError::InvalidArgument(format!(
                        "handle for parameter '{}' cannot bind '{}' on node '{}'",
                        handle.parameter(),
                        name,
                        self.id
                    )));
                }
                if handle.producer_id() == &self.id {
                    return Err(GraphError::InvalidArgument(format!(
                        "node '{}' cannot consume its own result",
                        self.id
                    )));
                }
                if handle.artifact_type() != *ty {
                    return Err(GraphError::InvalidArgument(format!(
                        "parameter '{}' of node '{}' expects {} but {} produces {}",
                        name,
                        self.id,
                        ty,
                        handle,
                        handle.artifact_type()
                    )));
                }
                Binding::Handle(handle.with_access(*access))
            }
            (ParameterValue::Handle(_), ParameterKind::Literal { .. }) => {
                return Err(GraphError::InvalidArgument(format!(
                    "literal parameter '{}' of node '{}' cannot be bound to a result",
                    name, self.id
                )));
            }
            (ParameterValue::Expression(expression), ParameterKind::Literal { .. }) => {
                Binding::Expression(expression)
            }
            (ParameterValue::Literal(Value::Float(n)), ParameterKind::Literal { .. }) if !n.is_finite() => {
                return Err(GraphError::InvalidArgument(format!(
                    "parameter '{}' of node '{}' cannot hold the non-finite value {}",
                    name, self.id, n
                )));
            }
            (ParameterValue::Literal(value), ParameterKind::Literal { .. }) => {
                Binding::Expression(value.to_expression())
            }
            (ParameterValue::Expression(_) | ParameterValue::Literal(_), ParameterKind::Artifact { .. }) => {
                return Err(GraphError::InvalidArgument(format!(
                    "artifact parameter '{}' of node '{}' must be bound to a result handle",
                    name, self.id
                )));
            }
        };

        let mut bindings = write(&self.bindings);
        if spec.kind.is_exclusive() {
            if let (Binding::Handle(current), Binding::Handle(next)) = (&bindings[index], &binding) {
                if !current.same_source(next) {
                    return Err(GraphError::IllegalState(format!(
                        "exclusive parameter '{}' of node '{}' is already bound to {}",
                        name, self.id, current
                    )));
                }
            }
        }

        tracing::debug!("Node {}: {} = {:?}", self.id, name, binding);
        bindings[index] = binding;
        Ok(())
    }

    pub fn clear_parameter(&self, name: &str) -> Result<(), GraphError> {
        self.set_parameter(name, ParameterValue::Null)
    }

    /// Binds `parameter` to `producer`'s `slot`.
    pub fn bind(&self, parameter: &str, producer: &Arc<GraphNode>, slot: &str) -> Result<(), GraphError> {
        let handle = ResultHandle::new(producer, slot, parameter)?;
        self.set_parameter(parameter, handle)
    }

    /// Supplies the artifact an input node publishes.
    pub fn inject(&self, artifact: ArtifactCell) -> Result<(), GraphError> {
        if !matches!(self.operation.kind(), NodeKind::Input) {
            return Err(GraphError::InvalidArgument(format!(
                "node '{}' ({}) is not an input node",
                self.id,
                self.executable_name()
            )));
        }
        let expected = self.result_class(SELF_SLOT)?;
        if artifact.artifact_type() != expected {
            return Err(GraphError::InvalidArgument(format!(
                "input '{}' expects {} but was given {}",
                self.id,
                expected,
                artifact.artifact_type()
            )));
        }
        *write(&self.injected) = Some(artifact);
        Ok(())
    }

    /// Incoming bindings, sorted.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = read(&self.bindings)
            .iter()
            .filter_map(|binding| match binding {
                Binding::Handle(handle) => Some(Edge {
                    producer: handle.producer_id().clone(),
                    slot: handle.slot().to_string(),
                    consumer: self.id.clone(),
                    parameter: handle.parameter().to_string(),
                    access: handle.access(),
                }),
                _ => None,
            })
            .collect();
        edges.sort();
        edges
    }

    /// Nodes this node reads results from.
    pub fn producers(&self) -> Vec<Arc<GraphNode>> {
        read(&self.bindings)
            .iter()
            .filter_map(|binding| match binding {
                Binding::Handle(handle) => handle.producer(),
                _ => None,
            })
            .collect()
    }

    /// True when every declared parameter can be resolved under `context`.
    /// Never computes or mutates anything.
    pub fn is_defined(&self, context: &ExecutionContext) -> bool {
        self.first_undefined(context).is_none()
    }

    /// The first parameter that keeps the node from being computed, with
    /// the reason.
    pub fn first_undefined(&self, context: &ExecutionContext) -> Option<(String, String)> {
        if matches!(self.operation.kind(), NodeKind::Input) && read(&self.injected).is_none() {
            return Some((SELF_SLOT.to_string(), "has no injected artifact".to_string()));
        }

        let bindings = read(&self.bindings);
        for (spec, binding) in self.operation.descriptor().parameters.iter().zip(bindings.iter()) {
            let problem = match (&spec.kind, binding) {
                (ParameterKind::Artifact { .. }, Binding::Handle(_)) => None,
                (ParameterKind::Artifact { .. }, _) => Some("is not bound to a producer".to_string()),
                (ParameterKind::Literal { ty }, Binding::Expression(expression)) if !expression.trim().is_empty() => {
                    match context.get_value(expression, self.id.as_str(), *ty) {
                        Ok(Value::Null) => Some("evaluates to null".to_string()),
                        Ok(_) => None,
                        Err(err) => Some(format!("cannot be evaluated: {}", err)),
                    }
                }
                (ParameterKind::Literal { .. }, _) if spec.default.is_some() => None,
                (ParameterKind::Literal { .. }, _) => Some("has no value".to_string()),
            };

            if let Some(reason) = problem {
                if !spec.nullable {
                    return Some((spec.name.clone(), reason));
                }
            }
        }

        None
    }

    /// First artifact parameter whose producer has not been computed.
    pub fn first_pending_dependency(&self) -> Option<String> {
        read(&self.bindings).iter().find_map(|binding| match binding {
            Binding::Handle(handle) if !handle.producer().is_some_and(|p| p.is_computed()) => {
                Some(handle.parameter().to_string())
            }
            _ => None,
        })
    }

    pub fn is_computed(&self) -> bool {
        read(&self.results).is_some()
    }

    /// Computes the node's results, once.
    ///
    /// Returns `Ok(true)` when the node is computed after the call. A node
    /// that is already computed returns immediately. An undefined node fails
    /// with `Computation` when `fail_on_undefined` is set and is otherwise
    /// skipped with `Ok(false)`. Concurrent callers are serialized; results
    /// are published all at once or not at all.
    pub fn prepare_results(&self, context: &ExecutionContext, fail_on_undefined: bool) -> Result<bool, GraphError> {
        let _claim = self.claim.lock().unwrap_or_else(PoisonError::into_inner);

        if self.is_computed() {
            return Ok(true);
        }

        if let Some((parameter, reason)) = self.first_undefined(context) {
            if fail_on_undefined {
                return Err(GraphError::Computation {
                    node: self.id.to_string(),
                    operation: self.executable_name(),
                    parameter,
                    reason,
                });
            }
            tracing::debug!("Skipping node {}: parameter '{}' {}", self.id, parameter, reason);
            return Ok(false);
        }

        let arguments = self.resolve_arguments(context)?;
        let results = self.invoke(arguments)?;
        *write(&self.results) = Some(Arc::new(results));

        tracing::info!("Node {} computed ({})", self.id, self.executable_name());
        Ok(true)
    }

    fn resolve_arguments(&self, context: &ExecutionContext) -> Result<Vec<Argument>, GraphError> {
        let bindings = read(&self.bindings).clone();
        let descriptor = self.operation.descriptor();
        let mut arguments = Vec::with_capacity(bindings.len());

        for (spec, binding) in descriptor.parameters.iter().zip(bindings) {
            let argument = match (&spec.kind, binding) {
                (ParameterKind::Artifact { .. }, Binding::Handle(handle)) => handle.get()?,
                (ParameterKind::Literal { ty }, Binding::Expression(expression)) if !expression.trim().is_empty() => {
                    let value = context
                        .get_value(&expression, self.id.as_str(), *ty)
                        .map_err(|err| self.computation(&spec.name, format!("cannot be evaluated: {}", err)))?;
                    if value.is_null() {
                        if !spec.nullable {
                            return Err(self.computation(&spec.name, "evaluates to null".to_string()));
                        }
                        Argument::Null
                    } else {
                        Argument::Value(value)
                    }
                }
                (ParameterKind::Literal { ty }, _) => match &spec.default {
                    Some(default) => Argument::Value(default.clone().coerce(*ty).unwrap_or_else(|| default.clone())),
                    None => Argument::Null,
                },
                (ParameterKind::Artifact { .. }, _) => Argument::Null,
            };
            arguments.push(argument);
        }

        Ok(arguments)
    }

    fn invoke(&self, values: Vec<Argument>) -> Result<ResultSet, GraphError> {
        let descriptor = self.operation.descriptor();
        let arguments = Arguments::new(descriptor, values);

        let (live, captured) = match self.operation.kind() {
            NodeKind::Method { call, .. } => {
                let receiver = arguments
                    .receiver()
                    .map_err(|err| self.invocation(&arguments, err))?
                    .clone();
                let outputs = call(&arguments).map_err(|err| self.invocation(&arguments, err))?;
                (self.collect_outputs(&arguments, outputs, Some(receiver))?, None)
            }
            NodeKind::Constructor { call } | NodeKind::Factory { call } => {
                let outputs = call(&arguments).map_err(|err| self.invocation(&arguments, err))?;
                (self.collect_outputs(&arguments, outputs, None)?, None)
            }
            NodeKind::Input => {
                let injected = read(&self.injected).clone().ok_or_else(|| {
                    GraphError::IllegalState(format!("input '{}' has no injected artifact", self.id))
                })?;
                (vec![injected], None)
            }
            NodeKind::Output => {
                let captured = match arguments.get(crate::OUTPUT_PARAMETER) {
                    Ok(Argument::Shared(snapshot)) => Some(snapshot.clone()),
                    _ => None,
                };
                (Vec::new(), captured)
            }
        };

        let snapshots = live
            .iter()
            .map(|cell| cell.snapshot())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| self.invocation(&arguments, err))?;

        Ok(ResultSet {
            live,
            snapshots,
            captured,
        })
    }

    /// Orders the returned artifacts by declared slot, checking nothing is
    /// missing, mistyped or undeclared.
    fn collect_outputs(
        &self,
        arguments: &Arguments<'_>,
        mut outputs: crate::Outputs,
        receiver: Option<ArtifactCell>,
    ) -> Result<Vec<ArtifactCell>, GraphError> {
        let mut live = Vec::new();

        for spec in &self.operation.descriptor().outputs {
            let cell = match (&receiver, spec.name.as_str()) {
                (Some(receiver), SELF_SLOT) => receiver.clone(),
                _ => {
                    let artifact = outputs.take(&spec.name).ok_or_else(|| {
                        self.invocation(
                            arguments,
                            OperationError::Failed(format!("no artifact returned for slot '{}'", spec.name)),
                        )
                    })?;
                    ArtifactCell::from_boxed(artifact)
                }
            };

            if cell.artifact_type() != spec.ty {
                return Err(self.invocation(
                    arguments,
                    OperationError::InvalidArgumentType {
                        field: spec.name.clone(),
                        expected: spec.ty.name().to_string(),
                        actual: cell.artifact_type().name().to_string(),
                    },
                ));
            }
            live.push(cell);
        }

        if let Some(extra) = outputs.slots().next() {
            return Err(self.invocation(
                arguments,
                OperationError::Failed(format!("returned undeclared slot '{}'", extra)),
            ));
        }

        Ok(live)
    }

    /// The live artifact in `slot`. Fails with `IllegalState` before
    /// computation or for an unknown slot.
    pub fn get_result(&self, slot: &str) -> Result<ArtifactCell, GraphError> {
        let (results, index) = self.computed_slot(slot)?;
        Ok(results.live[index].clone())
    }

    /// The snapshot of `slot` taken when the node was computed.
    pub fn get_immutable_result(&self, slot: &str) -> Result<Snapshot, GraphError> {
        let (results, index) = self.computed_slot(slot)?;
        Ok(results.snapshots[index].clone())
    }

    /// What an output node captured.
    pub fn captured(&self) -> Result<Snapshot, GraphError> {
        if !matches!(self.operation.kind(), NodeKind::Output) {
            return Err(GraphError::IllegalState(format!("node '{}' is not an output node", self.id)));
        }
        let results = self.results()?;
        results.captured.clone().ok_or_else(|| {
            GraphError::IllegalState(format!("output '{}' captured nothing (its input is unbound)", self.id))
        })
    }

    fn computed_slot(&self, slot: &str) -> Result<(Arc<ResultSet>, usize), GraphError> {
        let results = self.results()?;
        let index = self
            .operation
            .descriptor()
            .output_index(slot)
            .ok_or_else(|| GraphError::IllegalState(format!("node '{}' has no result slot '{}'", self.id, slot)))?;
        Ok((results, index))
    }

    fn results(&self) -> Result<Arc<ResultSet>, GraphError> {
        read(&self.results)
            .clone()
            .ok_or_else(|| GraphError::IllegalState(format!("node '{}' has not been computed", self.id)))
    }

    /// Forgets the computed results so the node can be computed again.
    pub fn reset(&self) {
        let _claim = self.claim.lock().unwrap_or_else(PoisonError::into_inner);
        *write(&self.results) = None;
    }

    /// A fresh node running the same operation with the same literal
    /// bindings. Result bindings, injected input and results are not copied.
    pub fn copy(&self) -> GraphNode {
        let node = GraphNode::new(self.operation.clone());
        let bindings: Vec<Binding> = read(&self.bindings)
            .iter()
            .map(|binding| match binding {
                Binding::Expression(expression) => Binding::Expression(expression.clone()),
                _ => Binding::Unbound,
            })
            .collect();
        *write(&node.bindings) = bindings;
        node
    }

    /// Serializable view for diagnostics.
    pub fn describe(&self) -> NodeSummary {
        let bindings = read(&self.bindings);
        let parameters = self
            .operation
            .descriptor()
            .parameters
            .iter()
            .zip(bindings.iter())
            .map(|(spec, binding)| ParameterSummary {
                name: spec.name.clone(),
                binding: match binding {
                    Binding::Unbound => None,
                    Binding::Expression(expression) => Some(expression.clone()),
                    Binding::Handle(handle) => Some(handle.to_string()),
                },
            })
            .collect();

        NodeSummary {
            id: self.id.clone(),
            executable: self.executable_name(),
            kind: self.operation.kind().label(),
            computed: self.is_computed(),
            parameters,
        }
    }

    fn parameter_index(&self, name: &str) -> Result<usize, GraphError> {
        self.operation
            .descriptor()
            .parameter_index(name)
            .ok_or_else(|| self.unknown("parameter", name))
    }

    fn unknown(&self, what: &str, name: &str) -> GraphError {
        GraphError::InvalidArgument(format!(
            "{} has no {} '{}' (node '{}')",
            self.executable_name(),
            what,
            name,
            self.id
        ))
    }

    fn computation(&self, parameter: &str, reason: String) -> GraphError {
        GraphError::Computation {
            node: self.id.to_string(),
            operation: self.executable_name(),
            parameter: parameter.to_string(),
            reason,
        }
    }

    fn invocation(&self, arguments: &Arguments<'_>, source: OperationError) -> GraphError {
        GraphError::Invocation {
            node: self.id.to_string(),
            operation: self.executable_name(),
            arguments: arguments.summary(),
            source,
        }
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("operation", &self.executable_name())
            .field("computed", &self.is_computed())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub executable: String,
    pub kind: &'static str,
    pub computed: bool,
    pub parameters: Vec<ParameterSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    pub binding: Option<String>,
}

// Node state stays consistent across a panic: results are published with a
// single assignment, so poisoned locks are recovered rather than propagated.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
