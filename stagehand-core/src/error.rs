use thiserror::Error;

use crate::node::NodeType;
use crate::NodeId;

/// Structural errors raised by [`crate::SceneGraph`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("node {0} already exists")]
    DuplicateId(NodeId),
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("parent {0} not found")]
    MissingParent(NodeId),
    #[error("{child:?} cannot be placed under {parent:?}")]
    InvalidNesting {
        child: NodeType,
        /// `None` means top level.
        parent: Option<NodeType>,
    },
    #[error("only one seating area is allowed, {0} already exists")]
    DuplicateArea(NodeId),
    #[error("moving {0} would create a cycle")]
    Cycle(NodeId),
}

/// A recorded state could not be applied to the graph.
///
/// The graph is left untouched when this is returned.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot apply change to node {node}: {source}")]
pub struct ApplyError {
    pub node: NodeId,
    #[source]
    pub source: GraphError,
}

impl ApplyError {
    pub fn new(node: NodeId, source: GraphError) -> Self {
        Self { node, source }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("history encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
