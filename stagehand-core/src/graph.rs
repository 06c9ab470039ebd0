//! Arena-backed scene graph.
//!
//! Nodes live in a map keyed by id; containers keep ordered child id lists
//! and every node records its parent, so there are no owning pointers and
//! no cycles. Render handles sit in a side table keyed by id and never
//! travel with node data.
//!
//! [`SceneGraph::apply_state`] is the single id-based replace/insert/remove
//! primitive. Local undo/redo, remote edits, catch-up replay and the relay's
//! authoritative copy all go through it.

use std::collections::{HashMap, HashSet};

use crate::error::{ApplyError, GraphError};
use crate::history::{ActionContext, ActionState, ContextEntry, OperationTag};
use crate::node::{Node, NodeKind, NodeType};
use crate::snapshot::NodeSnapshot;
use crate::{NodeId, Point};

/// Opaque token owned by the rendering collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderHandle(pub u64);

/// What an [`SceneGraph::apply_state`] call touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub upserted: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct SceneGraph {
    nodes: HashMap<NodeId, Node>,
    roots: Vec<NodeId>,
    handles: HashMap<NodeId, RenderHandle>,
    released: Vec<RenderHandle>,
    dirty: HashSet<NodeId>,
}

fn check_placement(child: NodeType, parent: Option<NodeType>) -> Result<(), GraphError> {
    let allowed = match parent {
        None => child.allowed_at_top_level(),
        Some(p) => p.accepts_child(child),
    };
    if allowed {
        Ok(())
    } else {
        Err(GraphError::InvalidNesting { child, parent })
    }
}

fn validate_subtree(snapshot: &NodeSnapshot) -> Result<(), GraphError> {
    for child in &snapshot.children {
        check_placement(child.node_type(), Some(snapshot.node_type()))?;
        validate_subtree(child)?;
    }
    Ok(())
}

fn collect_types(snapshot: &NodeSnapshot, out: &mut HashMap<NodeId, NodeType>) {
    out.insert(snapshot.id, snapshot.node_type());
    for child in &snapshot.children {
        collect_types(child, out);
    }
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshots(nodes: &[NodeSnapshot]) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        graph.replace_all(nodes)?;
        Ok(graph)
    }

    // ---- queries -------------------------------------------------------

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Mutable access for in-place edits; marks the node dirty.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let node = self.nodes.get_mut(&id)?;
        self.dirty.insert(id);
        Some(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Top-level ids in z-order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let node = self.nodes.get(&id)?;
        let siblings = match node.parent {
            Some(p) => self.children(p),
            None => self.roots.as_slice(),
        };
        siblings.iter().position(|c| *c == id)
    }

    /// All descendants of `id`, pre-order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// Parent chain of `id`, nearest first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(p) = current {
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    /// Whether `ancestor` is on the parent chain of `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.parent(id);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent(p);
        }
        false
    }

    /// The seating area, if the document has one.
    pub fn area(&self) -> Option<NodeId> {
        self.roots
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).map(Node::node_type) == Some(NodeType::Area))
    }

    /// Position in document space, summing parent offsets.
    ///
    /// Only translation is accumulated; rotation and scale are left to the
    /// renderer.
    pub fn world_position(&self, id: NodeId) -> Option<Point> {
        let mut node = self.nodes.get(&id)?;
        let mut position = node.transform.position();
        while let Some(parent) = node.parent {
            node = self.nodes.get(&parent)?;
            position.x += node.transform.x;
            position.y += node.transform.y;
        }
        Some(position)
    }

    // ---- snapshots -----------------------------------------------------

    /// Deep, handle-free copy of a node and its subtree.
    pub fn snapshot(&self, id: NodeId) -> Option<NodeSnapshot> {
        let node = self.nodes.get(&id)?;
        Some(NodeSnapshot {
            id,
            name: node.name.clone(),
            visible: node.visible,
            interactive: node.interactive,
            transform: node.transform,
            kind: node.kind.clone(),
            children: node
                .children
                .iter()
                .filter_map(|c| self.snapshot(*c))
                .collect(),
        })
    }

    pub fn top_level_snapshots(&self) -> Vec<NodeSnapshot> {
        self.roots.iter().filter_map(|id| self.snapshot(*id)).collect()
    }

    /// Snapshots of the given ids. Missing ids are skipped, as are ids whose
    /// ancestor is also requested (it is already embedded).
    pub fn snapshots_of(&self, ids: &[NodeId]) -> Vec<NodeSnapshot> {
        let wanted: HashSet<NodeId> = ids.iter().copied().collect();
        let mut seen = HashSet::new();
        ids.iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .filter(|id| !self.ancestors(*id).iter().any(|a| wanted.contains(a)))
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    /// Where each of `ids` currently sits.
    pub fn context_for(&self, ids: &[NodeId], operation: OperationTag) -> ActionContext {
        let mut context = ActionContext::new(operation);
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                context.entries.push(ContextEntry {
                    id: *id,
                    node_type: node.node_type(),
                    parent_id: node.parent,
                    top_level: node.parent.is_none(),
                    index: self.index_in_parent(*id),
                });
            }
        }
        context
    }

    // ---- structural edits ----------------------------------------------

    /// Insert a new subtree under `parent` (or at top level) at `index`
    /// (appended when `None` or out of range).
    pub fn insert(
        &mut self,
        snapshot: NodeSnapshot,
        parent: Option<NodeId>,
        index: Option<usize>,
    ) -> Result<(), GraphError> {
        let mut ids = HashSet::new();
        if let Some(dup) = snapshot.collect_unique_ids(&mut ids) {
            return Err(GraphError::DuplicateId(dup));
        }
        if let Some(existing) = ids.iter().find(|id| self.nodes.contains_key(id)) {
            return Err(GraphError::DuplicateId(*existing));
        }

        let parent_type = match parent {
            Some(p) => Some(
                self.nodes
                    .get(&p)
                    .ok_or(GraphError::MissingParent(p))?
                    .node_type(),
            ),
            None => None,
        };
        check_placement(snapshot.node_type(), parent_type)?;
        validate_subtree(&snapshot)?;
        if snapshot.node_type() == NodeType::Area {
            if let Some(existing) = self.area() {
                return Err(GraphError::DuplicateArea(existing));
            }
        }

        self.attach(snapshot, parent, index);
        Ok(())
    }

    /// Remove a node and its subtree, releasing their render handles.
    /// Returns the removed subtree.
    pub fn remove(&mut self, id: NodeId) -> Option<NodeSnapshot> {
        let snapshot = self.snapshot(id)?;
        for removed in self.evict(id) {
            if let Some(handle) = self.handles.remove(&removed) {
                self.released.push(handle);
            }
        }
        Some(snapshot)
    }

    /// Move `id` to the end of `new_parent`'s children (or the top level),
    /// keeping its world position.
    pub fn reparent(&mut self, id: NodeId, new_parent: Option<NodeId>) -> Result<(), GraphError> {
        let child_type = self
            .nodes
            .get(&id)
            .ok_or(GraphError::NodeNotFound(id))?
            .node_type();
        let parent_type = match new_parent {
            Some(p) => {
                if p == id || self.is_ancestor(id, p) {
                    return Err(GraphError::Cycle(id));
                }
                Some(
                    self.nodes
                        .get(&p)
                        .ok_or(GraphError::MissingParent(p))?
                        .node_type(),
                )
            }
            None => None,
        };
        check_placement(child_type, parent_type)?;

        let world = self.world_position(id).unwrap_or_default();
        let origin = new_parent
            .and_then(|p| self.world_position(p))
            .unwrap_or_default();

        self.unlink(id);
        self.link(id, new_parent, None);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.transform.x = world.x - origin.x;
            node.transform.y = world.y - origin.y;
        }
        self.sync_back_references(id);
        self.dirty.insert(id);
        Ok(())
    }

    /// Move `id` to `index` within its current sibling list.
    pub fn reorder(&mut self, id: NodeId, index: usize) -> Result<(), GraphError> {
        let parent = self
            .nodes
            .get(&id)
            .ok_or(GraphError::NodeNotFound(id))?
            .parent;
        self.unlink(id);
        self.link(id, parent, Some(index));
        self.dirty.insert(id);
        Ok(())
    }

    /// Replace the whole graph. On error the graph is left unchanged.
    pub fn replace_all(&mut self, nodes: &[NodeSnapshot]) -> Result<(), GraphError> {
        let mut fresh = SceneGraph::new();
        for snapshot in nodes {
            fresh.insert(snapshot.clone(), None, None)?;
        }
        for (id, handle) in self.handles.drain() {
            if fresh.nodes.contains_key(&id) {
                fresh.handles.insert(id, handle);
            } else {
                self.released.push(handle);
            }
        }
        fresh.released = std::mem::take(&mut self.released);
        fresh.dirty = fresh.nodes.keys().copied().collect();
        *self = fresh;
        Ok(())
    }

    pub fn clear(&mut self) {
        let handles: Vec<RenderHandle> = self.handles.drain().map(|(_, h)| h).collect();
        self.released.extend(handles);
        self.nodes.clear();
        self.roots.clear();
        self.dirty.clear();
    }

    // ---- apply primitive -----------------------------------------------

    /// Drive the graph to `state` by id.
    ///
    /// Every snapshot in `state.nodes` is upserted: an existing node has its
    /// data and subtree replaced (keeping its slot unless the context says
    /// otherwise), nodes living elsewhere are moved in, missing ones are
    /// created. Then every id in `state.affected_ids` that appears nowhere
    /// in the state's node trees is removed.
    ///
    /// The whole state is validated before anything is mutated.
    pub fn apply_state(&mut self, state: &ActionState) -> Result<ApplyReport, ApplyError> {
        let nodes = state.nodes();
        let context = state.context.as_ref();

        let mut present = HashSet::new();
        for snapshot in nodes {
            if let Some(dup) = snapshot.collect_unique_ids(&mut present) {
                return Err(ApplyError::new(dup, GraphError::DuplicateId(dup)));
            }
        }

        let mut removals = Vec::new();
        for id in state.affected_ids() {
            if !present.contains(id) && self.nodes.contains_key(id) && !removals.contains(id) {
                removals.push(*id);
            }
        }

        // Nodes that will no longer exist once the state is applied.
        let mut gone: HashSet<NodeId> = HashSet::new();
        for id in &removals {
            gone.insert(*id);
        }
        for id in removals.iter().chain(present.iter()) {
            if self.nodes.contains_key(id) {
                gone.extend(
                    self.descendants(*id)
                        .into_iter()
                        .filter(|d| !present.contains(d)),
                );
            }
        }

        let mut incoming_types = HashMap::new();
        for snapshot in nodes {
            collect_types(snapshot, &mut incoming_types);
        }

        // Order upserts so that parents introduced by the state come first.
        let mut available: HashSet<NodeId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| !gone.contains(id))
            .collect();
        let mut pending: Vec<(usize, Option<NodeId>)> = nodes
            .iter()
            .enumerate()
            .map(|(i, s)| (i, self.resolve_parent(s.id, context)))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while !pending.is_empty() {
            let waiting = pending.len();
            let mut rest = Vec::new();
            for (i, parent) in pending {
                let snapshot = &nodes[i];
                if let Some(p) = parent {
                    if snapshot.contains(p) {
                        return Err(ApplyError::new(snapshot.id, GraphError::Cycle(snapshot.id)));
                    }
                }
                if parent.map_or(true, |p| available.contains(&p)) {
                    available.extend(snapshot.ids());
                    order.push((i, parent));
                } else {
                    rest.push((i, parent));
                }
            }
            if rest.len() == waiting {
                let (i, parent) = rest[0];
                let missing = parent.unwrap_or(nodes[i].id);
                return Err(ApplyError::new(
                    nodes[i].id,
                    GraphError::MissingParent(missing),
                ));
            }
            pending = rest;
        }

        for &(i, parent) in &order {
            let snapshot = &nodes[i];
            let parent_type = parent.and_then(|p| {
                incoming_types
                    .get(&p)
                    .copied()
                    .or_else(|| self.nodes.get(&p).map(Node::node_type))
            });
            check_placement(snapshot.node_type(), parent_type)
                .and_then(|_| validate_subtree(snapshot))
                .map_err(|e| ApplyError::new(snapshot.id, e))?;
        }
        let incoming_areas: Vec<NodeId> = incoming_types
            .iter()
            .filter(|(_, t)| **t == NodeType::Area)
            .map(|(id, _)| *id)
            .collect();
        if incoming_areas.len() > 1 {
            return Err(ApplyError::new(
                incoming_areas[1],
                GraphError::DuplicateArea(incoming_areas[0]),
            ));
        }
        if let (Some(incoming), Some(existing)) = (incoming_areas.first(), self.area()) {
            if *incoming != existing && !gone.contains(&existing) && !present.contains(&existing) {
                return Err(ApplyError::new(
                    *incoming,
                    GraphError::DuplicateArea(existing),
                ));
            }
        }

        // Validation passed; mutate.
        let mut report = ApplyReport::default();
        let mut evicted = Vec::new();
        for (i, parent) in order {
            let snapshot = &nodes[i];
            let index_hint = context
                .and_then(|c| c.entry(snapshot.id))
                .and_then(|e| e.index);
            let old_slot = self.nodes.get(&snapshot.id).and_then(|n| {
                let old_parent = n.parent;
                self.index_in_parent(snapshot.id).map(|idx| (old_parent, idx))
            });

            for id in snapshot.ids() {
                if self.nodes.contains_key(&id) {
                    evicted.extend(self.evict(id));
                }
            }

            let index = index_hint.or_else(|| {
                old_slot
                    .filter(|(old_parent, _)| *old_parent == parent)
                    .map(|(_, idx)| idx)
            });
            self.attach(snapshot.clone(), parent, index);
            report.upserted.push(snapshot.id);
        }

        for id in removals {
            if self.remove(id).is_some() {
                report.removed.push(id);
            }
        }

        for id in evicted {
            if !self.nodes.contains_key(&id) {
                if let Some(handle) = self.handles.remove(&id) {
                    self.released.push(handle);
                }
            }
        }

        log::trace!(
            "Applied state: {} upserted, {} removed",
            report.upserted.len(),
            report.removed.len()
        );
        Ok(report)
    }

    // ---- render side table ---------------------------------------------

    /// Attach the renderer's handle for `id`, returning any previous one.
    pub fn attach_handle(
        &mut self,
        id: NodeId,
        handle: RenderHandle,
    ) -> Result<Option<RenderHandle>, GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::NodeNotFound(id));
        }
        Ok(self.handles.insert(id, handle))
    }

    pub fn handle(&self, id: NodeId) -> Option<RenderHandle> {
        self.handles.get(&id).copied()
    }

    /// Handles whose nodes no longer exist; the renderer must destroy them.
    pub fn take_released_handles(&mut self) -> Vec<RenderHandle> {
        std::mem::take(&mut self.released)
    }

    /// Nodes whose data changed since the last call, sorted.
    pub fn take_dirty(&mut self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .dirty
            .drain()
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        ids.sort();
        ids
    }

    // ---- internals -----------------------------------------------------

    fn resolve_parent(&self, id: NodeId, context: Option<&ActionContext>) -> Option<NodeId> {
        match context.and_then(|c| c.entry(id)) {
            Some(entry) => entry.parent_id,
            None => self.parent(id),
        }
    }

    fn attach(&mut self, snapshot: NodeSnapshot, parent: Option<NodeId>, index: Option<usize>) {
        let id = snapshot.id;
        self.materialize(snapshot, parent);
        self.link(id, parent, index);
        self.sync_back_references(id);
    }

    fn materialize(&mut self, snapshot: NodeSnapshot, parent: Option<NodeId>) {
        let NodeSnapshot {
            id,
            name,
            visible,
            interactive,
            transform,
            kind,
            children,
        } = snapshot;
        self.nodes.insert(
            id,
            Node {
                id,
                parent,
                children: children.iter().map(|c| c.id).collect(),
                name,
                visible,
                interactive,
                transform,
                kind,
            },
        );
        self.dirty.insert(id);
        for child in children {
            self.materialize(child, Some(id));
        }
    }

    fn link(&mut self, id: NodeId, parent: Option<NodeId>, index: Option<usize>) {
        let list = match parent {
            Some(p) => match self.nodes.get_mut(&p) {
                Some(node) => &mut node.children,
                None => return,
            },
            None => &mut self.roots,
        };
        let at = index.unwrap_or(list.len()).min(list.len());
        list.insert(at, id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = parent;
        }
    }

    fn unlink(&mut self, id: NodeId) -> Option<(Option<NodeId>, usize)> {
        let parent = self.nodes.get(&id)?.parent;
        let list = match parent {
            Some(p) => &mut self.nodes.get_mut(&p)?.children,
            None => &mut self.roots,
        };
        let index = list.iter().position(|c| *c == id)?;
        list.remove(index);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = None;
        }
        Some((parent, index))
    }

    /// Unlink and drop a subtree without touching render handles.
    fn evict(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut ids = vec![id];
        ids.extend(self.descendants(id));
        self.unlink(id);
        for removed in &ids {
            self.nodes.remove(removed);
            self.dirty.remove(removed);
        }
        ids
    }

    /// Re-derive seat and row back-references for a subtree.
    fn sync_back_references(&mut self, id: NodeId) {
        let mut subtree = vec![id];
        subtree.extend(self.descendants(id));
        for node_id in subtree {
            let parent = self.parent(node_id);
            let grandparent = parent.and_then(|p| self.parent(p));
            if let Some(node) = self.nodes.get_mut(&node_id) {
                match &mut node.kind {
                    NodeKind::Seat(props) => {
                        props.row_id = parent;
                        props.grid_id = grandparent;
                    }
                    NodeKind::Row(props) => {
                        props.grid_id = parent;
                    }
                    _ => {}
                }
            }
        }
    }
}
