use crate::planner::StepId;
use crate::types::{GroupId, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Step {0} already has a terminal record")]
    StepAlreadyRecorded(StepId),

    #[error("Step {0} cannot be completed with a pending outcome")]
    OutcomeNotTerminal(StepId),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid topology: {0}")]
    Topology(#[from] TopologyError),
}

/// Reasons a declared topology is rejected before anything is contacted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("Topology file could not be parsed: {0}")]
    Parse(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Replica group '{0}' has no members")]
    EmptyGroup(GroupId),

    #[error("Duplicate shard name '{0}'")]
    DuplicateShardName(GroupId),

    #[error("Group id '{0}' is declared more than once")]
    DuplicateGroupId(GroupId),

    #[error("Duplicate node id {node_id} in group '{group}'")]
    DuplicateNodeId { group: GroupId, node_id: NodeId },

    #[error("Address {address} is used by more than one node")]
    DuplicateAddress { address: String },

    #[error("Invalid address '{0}': expected host:port")]
    InvalidAddress(String),
}
