use crate::{Access, NodeId, SELF_SLOT};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// A binding from a producer's result slot to a consumer's parameter.
///
/// Edges order by slot name with the default `self` slot last, then by
/// parameter name with the exclusive parameter last; producer and consumer
/// ids break any remaining tie so the order is total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Edge {
    pub producer: NodeId,
    pub slot: String,
    pub consumer: NodeId,
    pub parameter: String,
    pub access: Access,
}

impl Edge {
    pub fn is_self_slot(&self) -> bool {
        self.slot == SELF_SLOT
    }

    pub fn is_exclusive(&self) -> bool {
        self.access == Access::Exclusive
    }
}

impl Ord for Edge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.is_self_slot()
            .cmp(&other.is_self_slot())
            .then_with(|| self.slot.cmp(&other.slot))
            .then_with(|| self.is_exclusive().cmp(&other.is_exclusive()))
            .then_with(|| self.parameter.cmp(&other.parameter))
            .then_with(|| self.producer.cmp(&other.producer))
            .then_with(|| self.consumer.cmp(&other.consumer))
    }
}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.access {
            Access::Exclusive => "=>",
            Access::Shared => "->",
        };
        write!(
            f,
            "{}.{} {} {}.{}",
            self.producer, self.slot, arrow, self.consumer, self.parameter
        )
    }
}
