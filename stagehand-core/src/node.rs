//! Scene node kinds and the seating nesting rules.
//!
//! Leaves: rectangle, ellipse, text, polygon, image, embedded SVG and seat.
//! Containers: group (any non-seating node), area → grid → row → seat.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{NodeId, Point};

/// Placement of a node relative to its parent's local space.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Transform {
    pub x: f32,
    pub y: f32,
    /// Degrees, clockwise.
    pub rotation: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub opacity: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            opacity: 1.0,
        }
    }
}

impl Transform {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct RectProps {
    pub width: f32,
    pub height: f32,
    pub fill: String,
    pub stroke: Option<String>,
    pub stroke_width: f32,
    pub corner_radius: f32,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct EllipseProps {
    pub radius_x: f32,
    pub radius_y: f32,
    pub fill: String,
    pub stroke: Option<String>,
    pub stroke_width: f32,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TextProps {
    pub content: String,
    pub font_size: f32,
    pub font_family: String,
    pub fill: String,
    pub align: TextAlign,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PolygonProps {
    pub points: Vec<Point>,
    pub closed: bool,
    pub fill: String,
    pub stroke: Option<String>,
    pub stroke_width: f32,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ImageProps {
    pub width: f32,
    pub height: f32,
    /// URL once the upload finished; empty while the asset is in flight.
    pub source: String,
    /// Upload tracked by the asset collaborator, if any.
    pub asset_id: Option<Uuid>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SvgProps {
    pub width: f32,
    pub height: f32,
    pub markup: String,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub enum SeatStatus {
    #[default]
    Available,
    Reserved,
    Sold,
    Blocked,
}

/// A seat is an ellipse that knows which row and grid it sits in.
///
/// `row_id` and `grid_id` are non-owning back-references, re-derived by
/// the graph whenever the seat is attached somewhere.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SeatProps {
    pub radius: f32,
    pub fill: String,
    pub label: String,
    pub status: SeatStatus,
    pub price: f32,
    pub row_id: Option<NodeId>,
    pub grid_id: Option<NodeId>,
}

/// Seat-generation settings for a grid.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct GridProps {
    pub seat_spacing: f32,
    pub seat_radius: f32,
    pub seat_color: String,
    pub seat_price: f32,
    pub row_spacing: f32,
}

impl Default for GridProps {
    fn default() -> Self {
        Self {
            seat_spacing: 30.0,
            seat_radius: 10.0,
            seat_color: "#4caf50".to_string(),
            seat_price: 0.0,
            row_spacing: 40.0,
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub enum LabelPlacement {
    #[default]
    Left,
    Right,
    Both,
    Hidden,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct RowProps {
    pub label: String,
    pub seat_spacing: f32,
    pub label_placement: LabelPlacement,
    pub grid_id: Option<NodeId>,
}

impl Default for RowProps {
    fn default() -> Self {
        Self {
            label: String::new(),
            seat_spacing: 30.0,
            label_placement: LabelPlacement::default(),
            grid_id: None,
        }
    }
}

/// Variant-specific data of a node.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum NodeKind {
    Rect(RectProps),
    Ellipse(EllipseProps),
    Text(TextProps),
    Polygon(PolygonProps),
    Image(ImageProps),
    Svg(SvgProps),
    Seat(SeatProps),
    Group,
    Grid(GridProps),
    Row(RowProps),
    Area,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Rect(_) => NodeType::Rect,
            NodeKind::Ellipse(_) => NodeType::Ellipse,
            NodeKind::Text(_) => NodeType::Text,
            NodeKind::Polygon(_) => NodeType::Polygon,
            NodeKind::Image(_) => NodeType::Image,
            NodeKind::Svg(_) => NodeType::Svg,
            NodeKind::Seat(_) => NodeType::Seat,
            NodeKind::Group => NodeType::Group,
            NodeKind::Grid(_) => NodeType::Grid,
            NodeKind::Row(_) => NodeType::Row,
            NodeKind::Area => NodeType::Area,
        }
    }

    pub fn is_container(&self) -> bool {
        self.node_type().is_container()
    }
}

/// Discriminant of [`NodeKind`], used for nesting checks and action context.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Rect,
    Ellipse,
    Text,
    Polygon,
    Image,
    Svg,
    Seat,
    Group,
    Grid,
    Row,
    Area,
}

impl NodeType {
    pub fn is_container(self) -> bool {
        matches!(
            self,
            NodeType::Group | NodeType::Grid | NodeType::Row | NodeType::Area
        )
    }

    /// Part of the area → grid → row → seat hierarchy.
    pub fn is_seating(self) -> bool {
        matches!(
            self,
            NodeType::Seat | NodeType::Row | NodeType::Grid | NodeType::Area
        )
    }

    pub fn allowed_at_top_level(self) -> bool {
        !matches!(self, NodeType::Seat | NodeType::Row | NodeType::Grid)
    }

    /// Whether a node of type `child` may live directly under `self`.
    pub fn accepts_child(self, child: NodeType) -> bool {
        match self {
            NodeType::Area => child == NodeType::Grid,
            NodeType::Grid => child == NodeType::Row,
            NodeType::Row => child == NodeType::Seat,
            NodeType::Group => !child.is_seating(),
            _ => false,
        }
    }
}

/// A live node inside a [`crate::SceneGraph`].
///
/// Identity, parent and child links are owned by the graph; everything
/// else may be edited in place through [`crate::SceneGraph::node_mut`].
/// Swapping `kind` to a different variant on a node that has children is
/// not supported; rebuild the subtree through `apply_state` instead.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub name: String,
    pub visible: bool,
    pub interactive: bool,
    pub transform: Transform,
    pub kind: NodeKind,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}
