use crate::{Access, Argument, ArtifactType, GraphError, GraphNode, NodeId};
use std::fmt;
use std::sync::{Arc, Weak};

/// Typed reference from a consumer parameter to a producer's result slot.
///
/// The producer is held weakly: a handle never keeps a node alive. Whether
/// [`ResultHandle::get`] yields the live artifact or a snapshot is fixed by
/// the consumer parameter the handle is bound to, not by the caller.
#[derive(Clone)]
pub struct ResultHandle {
    parameter: String,
    slot: String,
    producer_id: NodeId,
    producer: Weak<GraphNode>,
    ty: ArtifactType,
    access: Access,
}

impl ResultHandle {
    /// Refers to `producer`'s `slot`, to be bound to the consumer parameter
    /// `parameter`. Fails with `InvalidArgument` on an unknown slot.
    pub fn new(
        producer: &Arc<GraphNode>,
        slot: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Result<Self, GraphError> {
        let slot = slot.into();
        let ty = producer.result_class(&slot)?;
        Ok(Self {
            parameter: parameter.into(),
            slot,
            producer_id: producer.id().clone(),
            producer: Arc::downgrade(producer),
            ty,
            access: Access::Shared,
        })
    }

    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn producer_id(&self) -> &NodeId {
        &self.producer_id
    }

    pub fn producer(&self) -> Option<Arc<GraphNode>> {
        self.producer.upgrade()
    }

    /// Type of the producer's slot.
    pub fn artifact_type(&self) -> ArtifactType {
        self.ty
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub(crate) fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Same producer and slot.
    pub fn same_source(&self, other: &ResultHandle) -> bool {
        self.slot == other.slot && Weak::ptr_eq(&self.producer, &other.producer)
    }

    /// Fetches the producer's result: the live artifact for an exclusive
    /// binding, an immutable snapshot otherwise. Fails with `IllegalState`
    /// when the producer has not been computed or no longer exists.
    pub fn get(&self) -> Result<Argument, GraphError> {
        let producer = self.producer.upgrade().ok_or_else(|| {
            GraphError::IllegalState(format!(
                "producer '{}' of parameter '{}' was dropped",
                self.producer_id, self.parameter
            ))
        })?;

        match self.access {
            Access::Exclusive => producer.get_result(&self.slot).map(Argument::Live),
            Access::Shared => producer.get_immutable_result(&self.slot).map(Argument::Shared),
        }
    }
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("parameter", &self.parameter)
            .field("producer", &self.producer_id)
            .field("slot", &self.slot)
            .field("access", &self.access)
            .finish()
    }
}

impl fmt::Display for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.producer_id, self.slot)
    }
}
