//! Replay of operations onto a drawing surface.
//!
//! Rasterization belongs to the host. The core only decides which geometry
//! each tool produces and in what order it is drawn.

use kurbo::{Affine, BezPath, Circle, Point, Rect, Shape as _};

use crate::operation::{Operation, Rgba, Tool};

/// Arrowhead length along the shaft, in canvas units.
pub const ARROW_HEAD_LENGTH: f64 = 10.0;
/// Arrowhead half-width perpendicular to the shaft.
pub const ARROW_HEAD_HALF_WIDTH: f64 = 5.0;
/// Text size relative to the operation's line width.
pub const TEXT_SIZE_PER_LINE_WIDTH: f64 = 5.0;

/// Tolerance used when flattening circles into paths.
const PATH_TOLERANCE: f64 = 0.1;

/// A target that operations can be replayed onto.
pub trait Surface {
    /// Erase everything drawn so far.
    fn clear(&mut self);

    /// Stroke a path outline.
    fn stroke_path(&mut self, path: &BezPath, color: Rgba, width: f64);

    /// Fill a closed path.
    fn fill_path(&mut self, path: &BezPath, color: Rgba);

    /// Draw a text run with its baseline origin at `position`.
    fn draw_text(&mut self, position: Point, text: &str, color: Rgba, size: f64);
}

/// Draw a single operation using its tool's rule.
pub fn draw_operation<S: Surface + ?Sized>(surface: &mut S, op: &Operation) {
    let points = op.points();
    let color = op.color();
    let width = op.line_width();

    match op.tool() {
        Tool::Pencil | Tool::Eraser => {
            if let Some(path) = polyline(points) {
                surface.stroke_path(&path, color, width);
            }
        }
        Tool::Line => {
            if let Some((start, end)) = endpoints(points) {
                surface.stroke_path(&segment(start, end), color, width);
            }
        }
        Tool::Rectangle => {
            if let Some((start, end)) = endpoints(points) {
                let path = Rect::from_points(start, end).to_path(PATH_TOLERANCE);
                if let Some(fill) = op.fill_color() {
                    surface.fill_path(&path, fill);
                }
                surface.stroke_path(&path, color, width);
            }
        }
        Tool::Circle => {
            if let Some((center, edge)) = endpoints(points) {
                let path = Circle::new(center, center.distance(edge)).to_path(PATH_TOLERANCE);
                if let Some(fill) = op.fill_color() {
                    surface.fill_path(&path, fill);
                }
                surface.stroke_path(&path, color, width);
            }
        }
        Tool::Arrow => {
            if let Some((start, end)) = endpoints(points) {
                surface.stroke_path(&segment(start, end), color, width);
                surface.fill_path(&arrow_head(start, end), color);
            }
        }
        Tool::Text => {
            if let (Some(&position), Some(text)) = (points.first(), op.text_content()) {
                surface.draw_text(position, text, color, width * TEXT_SIZE_PER_LINE_WIDTH);
            }
        }
        Tool::Clear => {}
    }
}

/// Polyline through consecutive points. A single point becomes a dot-length segment.
pub fn polyline(points: &[Point]) -> Option<BezPath> {
    let (first, rest) = points.split_first()?;
    let mut path = BezPath::new();
    path.move_to(*first);
    if rest.is_empty() {
        path.line_to(*first);
    }
    for p in rest {
        path.line_to(*p);
    }
    Some(path)
}

/// Filled triangle at `end`, oriented along the segment angle.
pub fn arrow_head(start: Point, end: Point) -> BezPath {
    let angle = (end.y - start.y).atan2(end.x - start.x);
    let transform = Affine::translate(end.to_vec2()) * Affine::rotate(angle);

    let mut head = BezPath::new();
    head.move_to(Point::ZERO);
    head.line_to(Point::new(-ARROW_HEAD_LENGTH, -ARROW_HEAD_HALF_WIDTH));
    head.line_to(Point::new(-ARROW_HEAD_LENGTH, ARROW_HEAD_HALF_WIDTH));
    head.close_path();
    transform * head
}

fn segment(start: Point, end: Point) -> BezPath {
    let mut path = BezPath::new();
    path.move_to(start);
    path.line_to(end);
    path
}

fn endpoints(points: &[Point]) -> Option<(Point, Point)> {
    match points {
        [start, .., end] => Some((*start, *end)),
        _ => None,
    }
}

/// A recorded draw call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Clear,
    Stroke { path: BezPath, color: Rgba, width: f64 },
    Fill { path: BezPath, color: Rgba },
    Text { position: Point, text: String, color: Rgba, size: f64 },
}

/// Surface that records draw calls instead of rasterizing them.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    commands: Vec<DrawCommand>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl Surface for RecordingSurface {
    fn clear(&mut self) {
        self.commands.clear();
        self.commands.push(DrawCommand::Clear);
    }

    fn stroke_path(&mut self, path: &BezPath, color: Rgba, width: f64) {
        self.commands.push(DrawCommand::Stroke {
            path: path.clone(),
            color,
            width,
        });
    }

    fn fill_path(&mut self, path: &BezPath, color: Rgba) {
        self.commands.push(DrawCommand::Fill {
            path: path.clone(),
            color,
        });
    }

    fn draw_text(&mut self, position: Point, text: &str, color: Rgba, size: f64) {
        self.commands.push(DrawCommand::Text {
            position,
            text: text.to_string(),
            color,
            size,
        });
    }
}
