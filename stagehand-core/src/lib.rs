//! # stagehand-core — scene graph, snapshots and undo history
//!
//! The data half of the Stagehand seating editor. Everything here is
//! synchronous and single-owner: one editing session owns one [`Editor`],
//! and every mutation (local edit, undo/redo, or a change received from a
//! collaborator) funnels through [`SceneGraph::apply_state`].
//!
//! ```text
//! local edit ──► Editor::edit ──► diff(before, after) ──► HistoryStack::record ──► Action
//!                                                                               │
//! remote Action ──► Editor::apply_remote ──► SceneGraph::apply_state ◄──────────┘ (undo/redo)
//! ```
//!
//! ## Modules
//!
//! - [`node`] — node kinds, transforms and nesting rules
//! - [`snapshot`] — render-handle-free deep copies of nodes
//! - [`graph`] — the arena-backed scene graph and the id-based apply primitive
//! - [`diff`] — added / removed / modified detection between two node lists
//! - [`history`] — actions and the linear undo/redo stack
//! - [`editor`] — graph + history + selection behind a single mutation funnel

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod diff;
pub mod editor;
pub mod error;
pub mod graph;
pub mod history;
pub mod node;
pub mod snapshot;

pub use diff::{diff, Diff};
pub use editor::{EditScope, Editor};
pub use error::{ApplyError, GraphError, HistoryError};
pub use graph::{ApplyReport, RenderHandle, SceneGraph};
pub use history::{
    Action, ActionContext, ActionState, ContextEntry, HistoryStack, OperationTag,
};
pub use node::{
    EllipseProps, GridProps, ImageProps, LabelPlacement, Node, NodeKind, NodeType,
    PolygonProps, RectProps, RowProps, SeatProps, SeatStatus, SvgProps, TextAlign,
    TextProps, Transform,
};
pub use snapshot::NodeSnapshot;

/// Stable identifier of a scene node.
pub type NodeId = Uuid;
/// Identifier of a recorded [`Action`].
pub type ActionId = Uuid;
/// Identifier of a connected editor (supplied by the identity provider).
pub type UserId = Uuid;
/// Identifier of a document.
pub type DocumentId = Uuid;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Authoritative document state, as loaded by the persistence layer and
/// handed to a client at bootstrap.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub version: u64,
    /// Top-level nodes in z-order, children embedded.
    pub nodes: Vec<NodeSnapshot>,
}

impl DocumentSnapshot {
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            version: 0,
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(id: DocumentId, version: u64, nodes: Vec<NodeSnapshot>) -> Self {
        Self { id, version, nodes }
    }

    /// Total node count including nested children.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(NodeSnapshot::subtree_len).sum()
    }
}
