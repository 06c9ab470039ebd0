//! Actions and the linear undo/redo stack.
//!
//! The stack only stores actions and moves a cursor. Applying an action's
//! `before` or `after` state to the graph is the caller's job (see
//! [`crate::Editor`]).

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HistoryError;
use crate::node::NodeType;
use crate::snapshot::NodeSnapshot;
use crate::{now_millis, ActionId, NodeId, UserId};

/// What kind of edit produced an action.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum OperationTag {
    Create,
    Delete,
    Update,
    Move,
    Reparent,
    Reorder,
    Group,
    Ungroup,
    Custom(String),
}

/// Where one node sat when a state was captured.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ContextEntry {
    pub id: NodeId,
    pub node_type: NodeType,
    pub parent_id: Option<NodeId>,
    pub top_level: bool,
    /// Position within the parent's child list (or the top-level list).
    pub index: Option<usize>,
}

/// Structural metadata that a flat node list cannot express on its own.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ActionContext {
    pub operation: OperationTag,
    pub entries: Vec<ContextEntry>,
}

impl ActionContext {
    pub fn new(operation: OperationTag) -> Self {
        Self {
            operation,
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, id: NodeId) -> Option<&ContextEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Keep only entries for the given ids.
    pub fn retain_ids(&mut self, ids: &[NodeId]) {
        self.entries.retain(|e| ids.contains(&e.id));
    }
}

/// One side (before or after) of an action.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ActionState {
    pub nodes: Option<Vec<NodeSnapshot>>,
    pub selected_nodes: Option<Vec<NodeId>>,
    pub affected_ids: Option<Vec<NodeId>>,
    pub context: Option<ActionContext>,
}

impl ActionState {
    pub fn with_nodes(nodes: Vec<NodeSnapshot>) -> Self {
        Self {
            nodes: Some(nodes),
            ..Self::default()
        }
    }

    pub fn nodes(&self) -> &[NodeSnapshot] {
        self.nodes.as_deref().unwrap_or(&[])
    }

    pub fn affected_ids(&self) -> &[NodeId] {
        self.affected_ids.as_deref().unwrap_or(&[])
    }
}

/// A recorded mutation.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Action {
    pub id: ActionId,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    /// `None` for local edits; the sending user for replicated ones.
    /// Replicated actions are never broadcast again.
    pub author: Option<UserId>,
    pub before: ActionState,
    pub after: ActionState,
}

impl Action {
    pub fn new(before: ActionState, after: ActionState) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_millis(),
            author: None,
            before,
            after,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_author(mut self, author: UserId) -> Self {
        self.author = Some(author);
        self
    }

    pub fn is_local(&self) -> bool {
        self.author.is_none()
    }

    /// The same change reversed, under a fresh id.
    pub fn inverted(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: self.timestamp,
            author: self.author,
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

/// Linear history with a cursor.
///
/// `position` counts the actions currently applied: `0` means the cursor
/// sits before the first entry, `len()` means everything is applied.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct HistoryStack {
    actions: Vec<Action>,
    position: usize,
    limit: Option<usize>,
}

impl HistoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` actions; the oldest are dropped first.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit.max(1)),
            ..Self::default()
        }
    }

    /// Record a local mutation and return it for broadcasting.
    pub fn record(&mut self, before: ActionState, after: ActionState) -> Action {
        let action = Action::new(before, after);
        self.push(action.clone());
        action
    }

    /// Append a pre-built action, discarding everything after the cursor.
    pub fn push(&mut self, action: Action) {
        if self.position < self.actions.len() {
            log::debug!(
                "Discarding {} redo entries",
                self.actions.len() - self.position
            );
            self.actions.truncate(self.position);
        }
        self.actions.push(action);
        self.position = self.actions.len();

        if let Some(limit) = self.limit {
            if self.actions.len() > limit {
                let excess = self.actions.len() - limit;
                self.actions.drain(..excess);
                self.position -= excess;
            }
        }
    }

    /// Step back; returns the action whose `before` state should be applied.
    pub fn undo(&mut self) -> Option<Action> {
        if self.position == 0 {
            return None;
        }
        self.position -= 1;
        Some(self.actions[self.position].clone())
    }

    /// Step forward; returns the action whose `after` state should be applied.
    pub fn redo(&mut self) -> Option<Action> {
        if self.position >= self.actions.len() {
            return None;
        }
        let action = self.actions[self.position].clone();
        self.position += 1;
        Some(action)
    }

    pub fn can_undo(&self) -> bool {
        self.position > 0
    }

    pub fn can_redo(&self) -> bool {
        self.position < self.actions.len()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.actions.iter().any(|a| a.id == id)
    }

    /// Highest timestamp of any recorded action, applied or not.
    pub fn max_timestamp(&self) -> Option<u64> {
        self.actions.iter().map(|a| a.timestamp).max()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
        self.position = 0;
    }

    /// Persist the whole stack, cursor included, as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), HistoryError> {
        let json = serde_json::to_vec(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let bytes = std::fs::read(path)?;
        let mut stack: Self = serde_json::from_slice(&bytes)?;
        stack.position = stack.position.min(stack.actions.len());
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(x: f32) -> ActionState {
        ActionState::with_nodes(vec![NodeSnapshot::rect(1.0, 1.0).with_position(x, x)])
    }

    #[test]
    fn test_undo_returns_actions_in_reverse() {
        let mut history = HistoryStack::new();
        let ids: Vec<_> = (0..5)
            .map(|i| history.record(state(i as f32), state(i as f32 + 1.0)).id)
            .collect();

        let undone: Vec<_> = std::iter::from_fn(|| history.undo().map(|a| a.id)).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(undone, expected);
        assert_eq!(history.position(), 0);
        assert!(!history.can_undo());
        assert!(history.undo().is_none());
    }

    #[test]
    fn test_redo_walks_forward() {
        let mut history = HistoryStack::new();
        let a = history.record(state(0.0), state(1.0));
        let b = history.record(state(1.0), state(2.0));
        assert!(history.redo().is_none());

        history.undo();
        history.undo();
        assert_eq!(history.redo().map(|x| x.id), Some(a.id));
        assert_eq!(history.redo().map(|x| x.id), Some(b.id));
        assert!(!history.can_redo());
    }

    #[test]
    fn test_record_after_undo_truncates_redo() {
        let mut history = HistoryStack::new();
        history.record(state(0.0), state(1.0));
        history.record(state(1.0), state(2.0));
        history.record(state(2.0), state(3.0));

        history.undo();
        history.undo();
        assert!(history.can_redo());

        let c = history.record(state(1.0), state(9.0));
        assert!(!history.can_redo());
        assert_eq!(history.len(), 2);
        assert_eq!(history.actions()[1].id, c.id);
    }

    #[test]
    fn test_limit_drops_oldest() {
        let mut history = HistoryStack::with_limit(2);
        history.record(state(0.0), state(1.0));
        let b = history.record(state(1.0), state(2.0));
        let c = history.record(state(2.0), state(3.0));
        assert_eq!(history.len(), 2);
        assert_eq!(history.position(), 2);
        assert_eq!(history.actions()[0].id, b.id);
        assert_eq!(history.actions()[1].id, c.id);
    }

    #[test]
    fn test_max_timestamp_spans_undone_entries() {
        let mut history = HistoryStack::new();
        history.push(Action::new(state(0.0), state(1.0)).with_timestamp(100));
        history.push(Action::new(state(1.0), state(2.0)).with_timestamp(250));
        history.undo();
        assert_eq!(history.max_timestamp(), Some(250));
        history.clear();
        assert_eq!(history.max_timestamp(), None);
    }

    #[test]
    fn test_inverted_swaps_states() {
        let action = Action::new(state(0.0), state(1.0)).with_timestamp(42);
        let inverse = action.inverted();
        assert_ne!(inverse.id, action.id);
        assert_eq!(inverse.before, action.after);
        assert_eq!(inverse.after, action.before);
        assert_eq!(inverse.timestamp, 42);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut history = HistoryStack::new();
        history.record(state(0.0), state(1.0));
        history.record(state(1.0), state(2.0));
        history.undo();
        history.save(&path).unwrap();

        let loaded = HistoryStack::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.position(), 1);
        assert_eq!(loaded.actions(), history.actions());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = HistoryStack::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, HistoryError::Io(_)));
    }
}
