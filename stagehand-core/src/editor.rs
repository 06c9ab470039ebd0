//! Graph, history and selection behind a single mutation funnel.
//!
//! Local edits, undo/redo and replicated changes all end up in
//! [`SceneGraph::apply_state`] or inside an [`Editor::edit`] closure; nothing
//! else mutates the structure of the graph.

use std::collections::{HashMap, HashSet};

use crate::diff::diff;
use crate::error::{ApplyError, GraphError};
use crate::graph::{ApplyReport, RenderHandle, SceneGraph};
use crate::history::{Action, ActionState, HistoryStack, OperationTag};
use crate::snapshot::NodeSnapshot;
use crate::{DocumentSnapshot, NodeId};

/// Which part of the document an edit is diffed over.
#[derive(Debug, Clone, PartialEq)]
pub enum EditScope {
    /// The whole top-level list.
    TopLevel,
    /// The given ids, wherever they live. Include ids the edit is about to
    /// create so they show up on the `after` side.
    Nodes(Vec<NodeId>),
}

#[derive(Debug, Default)]
pub struct Editor {
    graph: SceneGraph,
    history: HistoryStack,
    selection: Vec<NodeId>,
}

impl Editor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: HistoryStack) -> Self {
        Self {
            history,
            ..Self::default()
        }
    }

    pub fn from_document(document: &DocumentSnapshot) -> Result<Self, GraphError> {
        let mut editor = Self::new();
        editor.load_document(document)?;
        Ok(editor)
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    pub fn history(&self) -> &HistoryStack {
        &self.history
    }

    pub fn selection(&self) -> &[NodeId] {
        &self.selection
    }

    /// Select the given ids; unknown ids are dropped.
    pub fn set_selection(&mut self, ids: Vec<NodeId>) {
        self.selection = ids;
        self.prune_selection();
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Replace the document wholesale. History and selection are cleared.
    pub fn load_document(&mut self, document: &DocumentSnapshot) -> Result<(), GraphError> {
        self.graph.replace_all(&document.nodes)?;
        self.history.clear();
        self.selection.clear();
        log::info!(
            "Loaded document {} v{} ({} nodes)",
            document.id,
            document.version,
            document.node_count()
        );
        Ok(())
    }

    /// Forget all history, e.g. when switching to another session.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    /// Current top-level state as a document snapshot.
    pub fn to_document(&self, document: &DocumentSnapshot) -> DocumentSnapshot {
        DocumentSnapshot::with_nodes(
            document.id,
            document.version,
            self.graph.top_level_snapshots(),
        )
    }

    /// Run a local mutation and record it.
    ///
    /// Returns the recorded action (to be broadcast), or `None` when the
    /// mutation changed nothing inside `scope`. If `mutate` fails, whatever
    /// it already changed inside `scope` is rolled back before the error is
    /// returned.
    pub fn edit<F>(
        &mut self,
        scope: EditScope,
        operation: OperationTag,
        mutate: F,
    ) -> Result<Option<Action>, GraphError>
    where
        F: FnOnce(&mut SceneGraph) -> Result<(), GraphError>,
    {
        let scope_ids = |graph: &SceneGraph| match &scope {
            EditScope::TopLevel => graph.roots().to_vec(),
            EditScope::Nodes(ids) => ids.clone(),
        };

        let before_ids = scope_ids(&self.graph);
        let before_nodes = self.capture(&scope);
        let before_placement = Placement::capture(&self.graph, &before_ids);
        let mut before_context = self.graph.context_for(&before_ids, operation.clone());
        let before_selection = self.selection.clone();

        let outcome = mutate(&mut self.graph);

        let after_ids = scope_ids(&self.graph);
        let after_nodes = self.capture(&scope);
        let mut changes = diff(&before_nodes, &after_nodes);

        // Reorders and reparents can leave every snapshot equal.
        let after_placement = Placement::capture(&self.graph, &after_ids);
        for id in before_placement.moved(&after_placement) {
            if changes.affected_ids.contains(&id) {
                continue;
            }
            let old = before_nodes.iter().find(|n| n.id == id);
            let new = after_nodes.iter().find(|n| n.id == id);
            if let (Some(old), Some(new)) = (old, new) {
                changes.before.push(old.clone());
                changes.after.push(new.clone());
                changes.affected_ids.push(id);
            }
        }

        before_context.retain_ids(&changes.affected_ids);
        let before = ActionState {
            nodes: Some(changes.before),
            selected_nodes: Some(before_selection),
            affected_ids: Some(changes.affected_ids.clone()),
            context: Some(before_context),
        };

        if let Err(e) = outcome {
            if !changes.affected_ids.is_empty() {
                if let Err(rollback) = self.graph.apply_state(&before) {
                    log::error!("Rollback after failed {:?} edit failed: {}", operation, rollback);
                }
            }
            return Err(e);
        }

        if changes.affected_ids.is_empty() {
            return Ok(None);
        }

        self.prune_selection();
        let mut after_context = self.graph.context_for(&after_ids, operation);
        after_context.retain_ids(&changes.affected_ids);
        let after = ActionState {
            nodes: Some(changes.after),
            selected_nodes: Some(self.selection.clone()),
            affected_ids: Some(changes.affected_ids),
            context: Some(after_context),
        };

        let action = self.history.record(before, after);
        log::debug!(
            "Recorded action {} ({} nodes affected)",
            action.id,
            action.after.affected_ids().len()
        );
        Ok(Some(action))
    }

    /// Undo the action at the cursor. Returns it so it can be broadcast.
    ///
    /// On failure the cursor is restored and the graph is untouched.
    pub fn undo(&mut self) -> Result<Option<Action>, ApplyError> {
        let Some(action) = self.history.undo() else {
            return Ok(None);
        };
        if let Err(e) = self.graph.apply_state(&action.before) {
            self.history.redo();
            return Err(e);
        }
        self.restore_selection(&action.before);
        Ok(Some(action))
    }

    pub fn redo(&mut self) -> Result<Option<Action>, ApplyError> {
        let Some(action) = self.history.redo() else {
            return Ok(None);
        };
        if let Err(e) = self.graph.apply_state(&action.after) {
            self.history.undo();
            return Err(e);
        }
        self.restore_selection(&action.after);
        Ok(Some(action))
    }

    /// Apply a replicated action's `after` state and record it.
    ///
    /// The action keeps its author, which marks it as never to be
    /// broadcast again. Nothing is recorded when the apply fails.
    pub fn apply_remote(&mut self, action: Action) -> Result<ApplyReport, ApplyError> {
        let report = self.graph.apply_state(&action.after)?;
        self.prune_selection();
        self.history.push(action);
        Ok(report)
    }

    pub fn attach_handle(
        &mut self,
        id: NodeId,
        handle: RenderHandle,
    ) -> Result<Option<RenderHandle>, GraphError> {
        self.graph.attach_handle(id, handle)
    }

    pub fn take_released_handles(&mut self) -> Vec<RenderHandle> {
        self.graph.take_released_handles()
    }

    pub fn take_dirty(&mut self) -> Vec<NodeId> {
        self.graph.take_dirty()
    }

    fn capture(&self, scope: &EditScope) -> Vec<NodeSnapshot> {
        match scope {
            EditScope::TopLevel => self.graph.top_level_snapshots(),
            EditScope::Nodes(ids) => self.graph.snapshots_of(ids),
        }
    }

    fn restore_selection(&mut self, state: &ActionState) {
        if let Some(selected) = &state.selected_nodes {
            self.selection = selected.clone();
        }
        self.prune_selection();
    }

    fn prune_selection(&mut self) {
        let graph = &self.graph;
        self.selection.retain(|id| graph.contains(*id));
    }
}

/// Parent and sibling order of a set of nodes at one point in time.
struct Placement {
    ids: Vec<NodeId>,
    parents: HashMap<NodeId, Option<NodeId>>,
    siblings: HashMap<Option<NodeId>, Vec<NodeId>>,
}

impl Placement {
    fn capture(graph: &SceneGraph, ids: &[NodeId]) -> Self {
        let mut placement = Self {
            ids: Vec::new(),
            parents: HashMap::new(),
            siblings: HashMap::new(),
        };
        for &id in ids {
            if !graph.contains(id) || placement.parents.contains_key(&id) {
                continue;
            }
            let parent = graph.parent(id);
            placement.ids.push(id);
            placement.parents.insert(id, parent);
            placement.siblings.entry(parent).or_insert_with(|| match parent {
                Some(p) => graph.children(p).to_vec(),
                None => graph.roots().to_vec(),
            });
        }
        placement
    }

    /// Ids that changed parent, or changed order relative to the siblings
    /// present on both sides. Shifts caused by inserts and removals alone
    /// do not count.
    fn moved(&self, after: &Placement) -> Vec<NodeId> {
        let mut ranks: HashMap<Option<NodeId>, (HashMap<NodeId, usize>, HashMap<NodeId, usize>)> =
            HashMap::new();
        let mut out = Vec::new();
        for &id in &self.ids {
            let (Some(parent), Some(after_parent)) =
                (self.parents.get(&id), after.parents.get(&id))
            else {
                continue;
            };
            if parent != after_parent {
                out.push(id);
                continue;
            }
            let (old_ranks, new_ranks) = ranks.entry(*parent).or_insert_with(|| {
                let old = self.siblings.get(parent).map(Vec::as_slice).unwrap_or(&[]);
                let new = after.siblings.get(parent).map(Vec::as_slice).unwrap_or(&[]);
                (survivor_ranks(old, new), survivor_ranks(new, old))
            });
            if old_ranks.get(&id) != new_ranks.get(&id) {
                out.push(id);
            }
        }
        out
    }
}

/// Position of each id in `list` counting only ids also found in `other`.
fn survivor_ranks(list: &[NodeId], other: &[NodeId]) -> HashMap<NodeId, usize> {
    let other: HashSet<NodeId> = other.iter().copied().collect();
    list.iter()
        .filter(|id| other.contains(id))
        .enumerate()
        .map(|(rank, id)| (*id, rank))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use crate::Point;
    use uuid::Uuid;

    fn editor_with(nodes: Vec<NodeSnapshot>) -> Editor {
        Editor::from_document(&DocumentSnapshot::with_nodes(Uuid::new_v4(), 1, nodes)).unwrap()
    }

    fn move_to(graph: &mut SceneGraph, id: NodeId, x: f32, y: f32) -> Result<(), GraphError> {
        let node = graph.node_mut(id).ok_or(GraphError::NodeNotFound(id))?;
        node.transform.x = x;
        node.transform.y = y;
        Ok(())
    }

    fn position(editor: &Editor, id: NodeId) -> Point {
        editor.graph().node(id).unwrap().transform.position()
    }

    #[test]
    fn test_basic_edit_and_undo() {
        let a = NodeSnapshot::rect(10.0, 10.0);
        let mut editor = editor_with(vec![a.clone()]);

        let action = editor
            .edit(EditScope::TopLevel, OperationTag::Move, |g| {
                move_to(g, a.id, 10.0, 10.0)
            })
            .unwrap()
            .unwrap();
        assert_eq!(action.before.nodes(), &[a.clone()]);
        assert_eq!(action.after.nodes()[0].transform.position(), Point::new(10.0, 10.0));
        assert_eq!(action.after.affected_ids(), &[a.id]);

        editor.undo().unwrap();
        assert_eq!(position(&editor, a.id), Point::new(0.0, 0.0));
        assert!(!editor.can_undo());

        editor.redo().unwrap();
        assert_eq!(position(&editor, a.id), Point::new(10.0, 10.0));
    }

    #[test]
    fn test_no_op_edit_records_nothing() {
        let a = NodeSnapshot::rect(10.0, 10.0);
        let mut editor = editor_with(vec![a.clone()]);
        let action = editor
            .edit(EditScope::TopLevel, OperationTag::Update, |_| Ok(()))
            .unwrap();
        assert!(action.is_none());
        assert!(editor.history().is_empty());
    }

    #[test]
    fn test_create_and_delete_round_trip_through_history() {
        let (row, grid, area) = {
            let row = NodeSnapshot::row();
            let grid = NodeSnapshot::grid().with_children(vec![row.clone()]);
            let area = NodeSnapshot::area().with_children(vec![grid.clone()]);
            (row, grid, area)
        };
        let mut editor = editor_with(vec![area]);
        let seat = NodeSnapshot::seat(8.0, "green");

        editor
            .edit(
                EditScope::Nodes(vec![seat.id]),
                OperationTag::Create,
                |g| g.insert(seat.clone(), Some(row.id), None),
            )
            .unwrap()
            .unwrap();
        assert_eq!(editor.graph().parent(seat.id), Some(row.id));

        editor.undo().unwrap();
        assert!(!editor.graph().contains(seat.id));

        editor.redo().unwrap();
        assert_eq!(editor.graph().parent(seat.id), Some(row.id));
        match &editor.graph().node(seat.id).unwrap().kind {
            NodeKind::Seat(props) => assert_eq!(props.grid_id, Some(grid.id)),
            _ => panic!("expected seat"),
        }
    }

    #[test]
    fn test_group_edit_undoes_to_original_order() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let b = NodeSnapshot::rect(2.0, 2.0);
        let c = NodeSnapshot::text("keep");
        let mut editor = editor_with(vec![a.clone(), c.clone(), b.clone()]);
        let original = editor.graph().top_level_snapshots();
        let group = NodeSnapshot::group();

        editor
            .edit(EditScope::TopLevel, OperationTag::Group, |g| {
                g.insert(group.clone(), None, None)?;
                g.reparent(a.id, Some(group.id))?;
                g.reparent(b.id, Some(group.id))
            })
            .unwrap()
            .unwrap();
        assert_eq!(editor.graph().roots(), &[c.id, group.id]);

        editor.undo().unwrap();
        assert_eq!(editor.graph().roots(), &[a.id, c.id, b.id]);
        assert_eq!(editor.graph().top_level_snapshots(), original);
    }

    #[test]
    fn test_reorder_is_recorded_and_undoable() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let b = NodeSnapshot::rect(2.0, 2.0);
        let mut editor = editor_with(vec![a.clone(), b.clone()]);

        let action = editor
            .edit(EditScope::TopLevel, OperationTag::Reorder, |g| g.reorder(b.id, 0))
            .unwrap()
            .expect("z-order change should be recorded");
        assert_eq!(editor.graph().roots(), &[b.id, a.id]);
        assert!(action.after.affected_ids().contains(&b.id));
        assert_eq!(editor.history().len(), 1);

        editor.undo().unwrap();
        assert_eq!(editor.graph().roots(), &[a.id, b.id]);

        editor.redo().unwrap();
        assert_eq!(editor.graph().roots(), &[b.id, a.id]);
    }

    #[test]
    fn test_reparent_without_snapshot_change_is_recorded() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let group = NodeSnapshot::group();
        let mut editor = editor_with(vec![a.clone(), group.clone()]);

        editor
            .edit(EditScope::Nodes(vec![a.id]), OperationTag::Reparent, |g| {
                g.reparent(a.id, Some(group.id))
            })
            .unwrap()
            .expect("reparent should be recorded");
        assert_eq!(editor.graph().parent(a.id), Some(group.id));
        assert_eq!(position(&editor, a.id), Point::new(0.0, 0.0));

        editor.undo().unwrap();
        assert_eq!(editor.graph().parent(a.id), None);
        assert_eq!(editor.graph().roots(), &[a.id, group.id]);
    }

    #[test]
    fn test_delete_does_not_record_shifted_siblings() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let b = NodeSnapshot::rect(2.0, 2.0);
        let c = NodeSnapshot::rect(3.0, 3.0);
        let mut editor = editor_with(vec![a.clone(), b.clone(), c.clone()]);

        let action = editor
            .edit(EditScope::TopLevel, OperationTag::Delete, |g| {
                g.remove(a.id).map(|_| ()).ok_or(GraphError::NodeNotFound(a.id))
            })
            .unwrap()
            .unwrap();
        assert_eq!(action.after.affected_ids(), &[a.id]);

        editor.undo().unwrap();
        assert_eq!(editor.graph().roots(), &[a.id, b.id, c.id]);
    }

    #[test]
    fn test_failed_edit_rolls_back() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let mut editor = editor_with(vec![a.clone()]);
        let ghost = Uuid::new_v4();

        let err = editor
            .edit(EditScope::TopLevel, OperationTag::Move, |g| {
                move_to(g, a.id, 50.0, 50.0)?;
                move_to(g, ghost, 1.0, 1.0)
            })
            .unwrap_err();
        assert_eq!(err, GraphError::NodeNotFound(ghost));
        assert_eq!(position(&editor, a.id), Point::new(0.0, 0.0));
        assert!(editor.history().is_empty());
    }

    #[test]
    fn test_new_edit_after_undo_truncates_redo() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let mut editor = editor_with(vec![a.clone()]);
        for x in [1.0, 2.0] {
            editor
                .edit(EditScope::TopLevel, OperationTag::Move, |g| move_to(g, a.id, x, x))
                .unwrap();
        }
        editor.undo().unwrap();
        assert!(editor.can_redo());
        editor
            .edit(EditScope::TopLevel, OperationTag::Move, |g| move_to(g, a.id, 9.0, 9.0))
            .unwrap();
        assert!(!editor.can_redo());
        assert_eq!(editor.history().len(), 2);
    }

    #[test]
    fn test_selection_follows_history() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let b = NodeSnapshot::rect(1.0, 1.0);
        let mut editor = editor_with(vec![a.clone(), b.clone()]);
        editor.set_selection(vec![a.id, Uuid::new_v4()]);
        assert_eq!(editor.selection(), &[a.id]);

        editor
            .edit(EditScope::Nodes(vec![a.id]), OperationTag::Delete, |g| {
                g.remove(a.id).map(|_| ()).ok_or(GraphError::NodeNotFound(a.id))
            })
            .unwrap();
        assert!(editor.selection().is_empty());

        editor.undo().unwrap();
        assert_eq!(editor.selection(), &[a.id]);
    }

    #[test]
    fn test_apply_remote_records_authored_action() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let mut editor = editor_with(vec![a.clone()]);
        let moved = a.clone().with_position(3.0, 4.0);
        let peer = Uuid::new_v4();
        let action = Action::new(
            ActionState {
                nodes: Some(vec![a.clone()]),
                affected_ids: Some(vec![a.id]),
                ..ActionState::default()
            },
            ActionState {
                nodes: Some(vec![moved]),
                affected_ids: Some(vec![a.id]),
                ..ActionState::default()
            },
        )
        .with_author(peer);

        editor.apply_remote(action.clone()).unwrap();
        assert_eq!(position(&editor, a.id), Point::new(3.0, 4.0));
        assert_eq!(editor.history().actions()[0].author, Some(peer));

        editor.undo().unwrap();
        assert_eq!(position(&editor, a.id), Point::new(0.0, 0.0));
    }

    #[test]
    fn test_load_document_clears_history() {
        let a = NodeSnapshot::rect(1.0, 1.0);
        let mut editor = editor_with(vec![a.clone()]);
        editor
            .edit(EditScope::TopLevel, OperationTag::Move, |g| move_to(g, a.id, 1.0, 1.0))
            .unwrap();
        assert!(editor.can_undo());

        let doc = DocumentSnapshot::with_nodes(Uuid::new_v4(), 2, vec![NodeSnapshot::text("x")]);
        editor.load_document(&doc).unwrap();
        assert!(!editor.can_undo());
        assert_eq!(editor.graph().len(), 1);
        assert_eq!(editor.to_document(&doc), doc);
    }
}
