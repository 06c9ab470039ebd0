//! Render-handle-free deep copies of scene nodes.
//!
//! A [`NodeSnapshot`] is what history, diffing and the wire format see.
//! It embeds its children by value, so comparing two snapshots with `==`
//! compares whole subtrees. Render handles live in a side table on the
//! graph and can never leak into a snapshot.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{
    EllipseProps, GridProps, ImageProps, NodeKind, NodeType, PolygonProps, RectProps,
    RowProps, SeatProps, SeatStatus, SvgProps, TextAlign, TextProps, Transform,
};
use crate::{NodeId, Point};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub visible: bool,
    pub interactive: bool,
    pub transform: Transform,
    pub kind: NodeKind,
    pub children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    /// New node of the given kind with a fresh id at the origin.
    pub fn new(kind: NodeKind) -> Self {
        let name = format!("{:?}", kind.node_type());
        Self {
            id: Uuid::new_v4(),
            name,
            visible: true,
            interactive: true,
            transform: Transform::default(),
            kind,
            children: Vec::new(),
        }
    }

    pub fn rect(width: f32, height: f32) -> Self {
        Self::new(NodeKind::Rect(RectProps {
            width,
            height,
            fill: "#cccccc".to_string(),
            stroke: None,
            stroke_width: 0.0,
            corner_radius: 0.0,
        }))
    }

    pub fn ellipse(radius_x: f32, radius_y: f32) -> Self {
        Self::new(NodeKind::Ellipse(EllipseProps {
            radius_x,
            radius_y,
            fill: "#cccccc".to_string(),
            stroke: None,
            stroke_width: 0.0,
        }))
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(NodeKind::Text(TextProps {
            content: content.into(),
            font_size: 16.0,
            font_family: "sans-serif".to_string(),
            fill: "#000000".to_string(),
            align: TextAlign::Left,
        }))
    }

    pub fn polygon(points: Vec<Point>) -> Self {
        Self::new(NodeKind::Polygon(PolygonProps {
            points,
            closed: true,
            fill: "#cccccc".to_string(),
            stroke: None,
            stroke_width: 0.0,
        }))
    }

    pub fn image(width: f32, height: f32, source: impl Into<String>) -> Self {
        Self::new(NodeKind::Image(ImageProps {
            width,
            height,
            source: source.into(),
            asset_id: None,
        }))
    }

    pub fn svg(width: f32, height: f32, markup: impl Into<String>) -> Self {
        Self::new(NodeKind::Svg(SvgProps {
            width,
            height,
            markup: markup.into(),
        }))
    }

    pub fn seat(radius: f32, fill: impl Into<String>) -> Self {
        Self::new(NodeKind::Seat(SeatProps {
            radius,
            fill: fill.into(),
            label: String::new(),
            status: SeatStatus::Available,
            price: 0.0,
            row_id: None,
            grid_id: None,
        }))
    }

    pub fn group() -> Self {
        Self::new(NodeKind::Group)
    }

    pub fn row() -> Self {
        Self::new(NodeKind::Row(RowProps::default()))
    }

    pub fn grid() -> Self {
        Self::new(NodeKind::Grid(GridProps::default()))
    }

    pub fn area() -> Self {
        Self::new(NodeKind::Area)
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.transform.x = x;
        self.transform.y = y;
        self
    }

    pub fn with_children(mut self, children: Vec<NodeSnapshot>) -> Self {
        self.children = children;
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Self::subtree_len).sum::<usize>()
    }

    /// Ids in this subtree, pre-order.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.subtree_len());
        self.collect_ids_into(&mut out);
        out
    }

    fn collect_ids_into(&self, out: &mut Vec<NodeId>) {
        out.push(self.id);
        for child in &self.children {
            child.collect_ids_into(out);
        }
    }

    /// Insert every id of the subtree into `set`; returns the first id that
    /// was already present, if any.
    pub(crate) fn collect_unique_ids(&self, set: &mut HashSet<NodeId>) -> Option<NodeId> {
        if !set.insert(self.id) {
            return Some(self.id);
        }
        self.children
            .iter()
            .find_map(|child| child.collect_unique_ids(set))
    }

    /// Find a node anywhere in this subtree.
    pub fn find(&self, id: NodeId) -> Option<&NodeSnapshot> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.find(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_assign_fresh_ids() {
        let a = NodeSnapshot::rect(10.0, 10.0);
        let b = NodeSnapshot::rect(10.0, 10.0);
        assert_ne!(a.id, b.id);
        assert_eq!(a.node_type(), NodeType::Rect);
        assert!(a.visible && a.interactive);
    }

    #[test]
    fn test_equality_is_deep() {
        let seat = NodeSnapshot::seat(8.0, "green");
        let row = NodeSnapshot::row().with_children(vec![seat.clone()]);

        let mut recolored = row.clone();
        if let NodeKind::Seat(props) = &mut recolored.children[0].kind {
            props.fill = "red".into();
        }

        assert_eq!(row, row.clone());
        assert_ne!(row, recolored);
    }

    #[test]
    fn test_ids_are_preorder() {
        let s1 = NodeSnapshot::seat(8.0, "green");
        let s2 = NodeSnapshot::seat(8.0, "green");
        let row = NodeSnapshot::row().with_children(vec![s1.clone(), s2.clone()]);
        let grid = NodeSnapshot::grid().with_children(vec![row.clone()]);

        assert_eq!(grid.ids(), vec![grid.id, row.id, s1.id, s2.id]);
        assert_eq!(grid.subtree_len(), 4);
        assert!(grid.contains(s2.id));
        assert_eq!(grid.find(row.id).map(|n| n.children.len()), Some(2));
    }

    #[test]
    fn test_collect_unique_ids_reports_duplicate() {
        let seat = NodeSnapshot::seat(8.0, "green");
        let row = NodeSnapshot::row().with_children(vec![seat.clone(), seat.clone()]);
        let mut set = HashSet::new();
        assert_eq!(row.collect_unique_ids(&mut set), Some(seat.id));
    }

    #[test]
    fn test_positioned_builder() {
        let text = NodeSnapshot::text("Stage")
            .with_name("label")
            .with_position(5.0, 7.5);
        assert_eq!(text.name, "label");
        assert_eq!(text.transform.position(), Point::new(5.0, 7.5));
    }
}
