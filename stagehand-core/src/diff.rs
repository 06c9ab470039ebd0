//! Id-keyed diff of two top-level node lists.

use std::collections::{HashMap, HashSet};

use crate::snapshot::NodeSnapshot;
use crate::NodeId;

/// Minimal before/after description of a change.
///
/// `before` holds removed and modified nodes (old values, old-list order),
/// `after` holds modified and added nodes (new values, new-list order).
/// Applying `after` over the old list and removing the `affected_ids`
/// missing from it yields the new list; the reverse holds for `before`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub before: Vec<NodeSnapshot>,
    pub after: Vec<NodeSnapshot>,
    pub affected_ids: Vec<NodeId>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.affected_ids.is_empty()
    }
}

/// Compare two node lists by id, using deep equality for modification.
pub fn diff(old: &[NodeSnapshot], new: &[NodeSnapshot]) -> Diff {
    let old_by_id: HashMap<NodeId, &NodeSnapshot> = old.iter().map(|n| (n.id, n)).collect();
    let new_by_id: HashMap<NodeId, &NodeSnapshot> = new.iter().map(|n| (n.id, n)).collect();

    let mut out = Diff::default();
    let mut affected = HashSet::new();

    for node in old {
        match new_by_id.get(&node.id) {
            None => {
                out.before.push(node.clone());
                if affected.insert(node.id) {
                    out.affected_ids.push(node.id);
                }
            }
            Some(updated) if *updated != node => {
                out.before.push(node.clone());
                out.after.push((*updated).clone());
                if affected.insert(node.id) {
                    out.affected_ids.push(node.id);
                }
            }
            Some(_) => {}
        }
    }

    for node in new {
        if !old_by_id.contains_key(&node.id) {
            out.after.push(node.clone());
            if affected.insert(node.id) {
                out.affected_ids.push(node.id);
            }
        }
    }

    out
}
