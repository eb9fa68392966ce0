use crate::{EntryHandle, Scheduler};
use chrono::Utc;
use graphcore::{Access, Edge, ExecutionContext, GraphError, GraphNode, NodeId, PipelineEvent};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// The nodes of one generation run
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Arc<GraphNode>>,
    index: HashMap<NodeId, usize>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `node` and returns the shared handle used to bind consumers.
    pub fn add(&mut self, node: GraphNode) -> Result<Arc<GraphNode>, GraphError> {
        self.insert(Arc::new(node))
    }

    pub fn insert(&mut self, node: Arc<GraphNode>) -> Result<Arc<GraphNode>, GraphError> {
        if self.index.contains_key(node.id()) {
            return Err(GraphError::InvalidArgument(format!(
                "graph already contains a node with id '{}'",
                node.id()
            )));
        }
        self.index.insert(node.id().clone(), self.nodes.len());
        self.nodes.push(node.clone());
        Ok(node)
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<GraphNode>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> &[Arc<GraphNode>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every binding in the graph, sorted.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.nodes.iter().flat_map(|node| node.edges()).collect();
        edges.sort();
        edges
    }

    /// Checks every producer belongs to this graph, that each producer slot
    /// has at most one exclusive consumer, and that bindings are acyclic.
    /// Returns the nodes in dependency order.
    pub fn validate(&self) -> Result<Vec<Arc<GraphNode>>, GraphError> {
        let mut graph: DiGraph<usize, Edge> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
        let mut owners: HashMap<(NodeId, String), NodeId> = HashMap::new();

        for (consumer, node) in self.nodes.iter().enumerate() {
            for edge in node.edges() {
                let producer = self.index.get(&edge.producer).copied().ok_or_else(|| {
                    GraphError::IllegalState(format!(
                        "{} refers to node '{}' which is not in the graph",
                        edge, edge.producer
                    ))
                })?;
                if edge.access == Access::Exclusive {
                    let key = (edge.producer.clone(), edge.slot.clone());
                    if let Some(owner) = owners.insert(key, edge.consumer.clone()) {
                        return Err(GraphError::IllegalState(format!(
                            "'{}.{}' is mutated by both '{}' and '{}'",
                            edge.producer, edge.slot, owner, edge.consumer
                        )));
                    }
                }
                graph.add_edge(indices[producer], indices[consumer], edge);
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let node = &self.nodes[graph[cycle.node_id()]];
            GraphError::IllegalState(format!("bindings form a cycle through node '{}'", node.id()))
        })?;

        Ok(order.into_iter().map(|ix| self.nodes[graph[ix]].clone()).collect())
    }

    /// Registers every node with `scheduler`, declaring its producers as
    /// dependencies. Nodes are registered in dependency order so each
    /// producer's entry exists before its consumers'.
    ///
    /// In lenient mode a node whose producer was skipped is skipped too.
    pub fn schedule(
        &self,
        scheduler: &Scheduler,
        context: &Arc<ExecutionContext>,
        fail_on_undefined: bool,
    ) -> Result<Schedule, GraphError> {
        let order = self.validate()?;
        let run_id = scheduler.run_id();
        let mut entries: HashMap<NodeId, EntryHandle> = HashMap::with_capacity(order.len());

        for node in order {
            let dependencies: Vec<EntryHandle> = node
                .edges()
                .iter()
                .filter_map(|edge| entries.get(&edge.producer).cloned())
                .collect();

            let task_node = node.clone();
            let context = context.clone();
            let events = scheduler.events().clone();
            let entry = scheduler.register(node.id().to_string(), &dependencies, move || {
                if !fail_on_undefined {
                    if let Some(parameter) = task_node.first_pending_dependency() {
                        tracing::debug!("Skipping node {}: producer of '{}' was skipped", task_node.id(), parameter);
                        events.emit(PipelineEvent::NodeSkipped {
                            run_id,
                            node: task_node.id().clone(),
                            parameter,
                            timestamp: Utc::now(),
                        });
                        return Ok(());
                    }
                }

                if task_node.prepare_results(&context, fail_on_undefined)? {
                    events.emit(PipelineEvent::NodeComputed {
                        run_id,
                        node: task_node.id().clone(),
                        operation: task_node.executable_name(),
                        slots: task_node.result_slots().iter().map(|s| s.to_string()).collect(),
                        timestamp: Utc::now(),
                    });
                } else {
                    let parameter = task_node
                        .first_undefined(&context)
                        .map(|(parameter, _)| parameter)
                        .unwrap_or_default();
                    events.emit(PipelineEvent::NodeSkipped {
                        run_id,
                        node: task_node.id().clone(),
                        parameter,
                        timestamp: Utc::now(),
                    });
                }
                Ok(())
            });
            entries.insert(node.id().clone(), entry);
        }

        Ok(Schedule { entries })
    }

    /// Forgets every node's results.
    pub fn reset(&self) {
        for node in &self.nodes {
            node.reset();
        }
    }
}

/// Scheduler entries created for a graph, by node id
#[derive(Debug)]
pub struct Schedule {
    entries: HashMap<NodeId, EntryHandle>,
}

impl Schedule {
    pub fn entry(&self, node: &NodeId) -> Option<&EntryHandle> {
        self.entries.get(node)
    }

    /// Entries for `nodes`, for use with `Scheduler::await_entries`.
    pub fn entries_for(&self, nodes: &[&Arc<GraphNode>]) -> Vec<EntryHandle> {
        nodes
            .iter()
            .filter_map(|node| self.entries.get(node.id()).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
