//! Drawing operations: the immutable unit of the page log.

use kurbo::Point;
use peniko::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for an operation.
pub type OperationId = Uuid;

/// Identifier of a participant (one per connected client).
pub type AuthorId = String;

/// Identifier of a page (slide) within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

/// Drawing tools that produce operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pencil,
    Line,
    Rectangle,
    Circle,
    Arrow,
    Eraser,
    Text,
    /// Log-clearing marker (only appended under [`ClearPolicy::Marker`](crate::page_log::ClearPolicy)).
    Clear,
}

impl Tool {
    /// Tools defined by a start and an end point.
    pub fn is_shape(self) -> bool {
        matches!(self, Tool::Line | Tool::Rectangle | Tool::Circle | Tool::Arrow)
    }

    /// Tools that record a polyline of pointer positions.
    pub fn is_freehand(self) -> bool {
        matches!(self, Tool::Pencil | Tool::Eraser)
    }

    /// Minimum number of points an operation of this tool must carry.
    pub fn min_points(self) -> usize {
        match self {
            Tool::Line | Tool::Rectangle | Tool::Circle | Tool::Arrow => 2,
            Tool::Pencil | Tool::Eraser | Tool::Text => 1,
            Tool::Clear => 0,
        }
    }
}

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub const fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    pub const fn transparent() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn is_transparent(&self) -> bool {
        self.a == 0
    }

    /// Parse a CSS-style color (`#rgb`, `#rrggbb`, `#rrggbbaa` or `transparent`).
    pub fn from_hex(color: &str) -> Option<Self> {
        let color = color.trim();
        if color.eq_ignore_ascii_case("transparent") {
            return Some(Self::transparent());
        }

        let hex = color.strip_prefix('#')?;
        if !hex.is_ascii() {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
        match hex.len() {
            3 => {
                // #rgb -> #rrggbb
                let r = channel(0..1)? * 17;
                let g = channel(1..2)? * 17;
                let b = channel(2..3)? * 17;
                Some(Self::new(r, g, b, 255))
            }
            6 => Some(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?, 255)),
            8 => Some(Self::new(
                channel(0..2)?,
                channel(2..4)?,
                channel(4..6)?,
                channel(6..8)?,
            )),
            _ => None,
        }
    }

    /// Format as `#rrggbb`, or `#rrggbbaa` when not fully opaque.
    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

impl Default for Rgba {
    fn default() -> Self {
        Self::black()
    }
}

impl From<Color> for Rgba {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self::new(rgba.r, rgba.g, rgba.b, rgba.a)
    }
}

impl From<Rgba> for Color {
    fn from(color: Rgba) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

/// Style properties captured from the toolbar when an operation is created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeStyle {
    /// Stroke color.
    pub color: Rgba,
    /// Fill color (None = no fill).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<Rgba>,
    /// Stroke width.
    pub line_width: f64,
}

impl StrokeStyle {
    pub const DEFAULT_LINE_WIDTH: f64 = 3.0;

    pub fn new(color: Rgba, line_width: f64) -> Self {
        Self {
            color,
            fill_color: None,
            line_width,
        }
    }

    /// Set the fill color. A transparent fill is stored as no fill.
    pub fn with_fill(mut self, fill: Rgba) -> Self {
        self.fill_color = (!fill.is_transparent()).then_some(fill);
        self
    }
}

impl Default for StrokeStyle {
    fn default() -> Self {
        Self::new(Rgba::black(), Self::DEFAULT_LINE_WIDTH)
    }
}

/// Structural problems that make an operation unusable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidOperation {
    #[error("{tool:?} needs at least {needed} points, got {got}")]
    TooFewPoints { tool: Tool, needed: usize, got: usize },
    #[error("non-finite coordinate")]
    NonFiniteCoordinate,
    #[error("line width must be positive and finite, got {0}")]
    BadLineWidth(f64),
    #[error("text operation without text")]
    MissingText,
}

/// One immutable, author-attributed drawing action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    id: OperationId,
    page_id: PageId,
    author_id: AuthorId,
    tool: Tool,
    color: Rgba,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fill_color: Option<Rgba>,
    line_width: f64,
    #[serde(default)]
    points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    timestamp: u64,
}

impl Operation {
    /// Create a new operation with a fresh id and the current timestamp.
    pub fn new(
        page_id: PageId,
        author_id: impl Into<AuthorId>,
        tool: Tool,
        points: Vec<Point>,
        style: StrokeStyle,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            page_id,
            author_id: author_id.into(),
            tool,
            color: style.color,
            fill_color: style.fill_color,
            line_width: style.line_width,
            points,
            text: None,
            timestamp: now_millis(),
        }
    }

    /// Create a two-point shape (line, rectangle, circle, arrow).
    pub fn shape(
        page_id: PageId,
        author_id: impl Into<AuthorId>,
        tool: Tool,
        start: Point,
        end: Point,
        style: StrokeStyle,
    ) -> Self {
        Self::new(page_id, author_id, tool, vec![start, end], style)
    }

    /// Create a text operation anchored at `position`.
    pub fn text(
        page_id: PageId,
        author_id: impl Into<AuthorId>,
        position: Point,
        text: impl Into<String>,
        style: StrokeStyle,
    ) -> Self {
        let mut op = Self::new(page_id, author_id, Tool::Text, vec![position], style);
        op.text = Some(text.into());
        op
    }

    /// Create a log-clearing marker.
    pub fn clear_marker(page_id: PageId, author_id: impl Into<AuthorId>) -> Self {
        Self::new(page_id, author_id, Tool::Clear, Vec::new(), StrokeStyle::default())
    }

    /// Attach text to an operation under construction.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn color(&self) -> Rgba {
        self.color
    }

    pub fn fill_color(&self) -> Option<Rgba> {
        self.fill_color
    }

    pub fn line_width(&self) -> f64 {
        self.line_width
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn text_content(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn style(&self) -> StrokeStyle {
        StrokeStyle {
            color: self.color,
            fill_color: self.fill_color,
            line_width: self.line_width,
        }
    }

    pub fn is_clear_marker(&self) -> bool {
        self.tool == Tool::Clear
    }

    /// Check that the operation can be replayed.
    pub fn validate(&self) -> Result<(), InvalidOperation> {
        let needed = self.tool.min_points();
        if self.points.len() < needed {
            return Err(InvalidOperation::TooFewPoints {
                tool: self.tool,
                needed,
                got: self.points.len(),
            });
        }
        if self.points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(InvalidOperation::NonFiniteCoordinate);
        }
        if self.tool != Tool::Clear && !(self.line_width.is_finite() && self.line_width > 0.0) {
            return Err(InvalidOperation::BadLineWidth(self.line_width));
        }
        if self.tool == Tool::Text && self.text.as_deref().is_none_or(str::is_empty) {
            return Err(InvalidOperation::MissingText);
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_colors() {
        assert_eq!(Rgba::from_hex("#000000"), Some(Rgba::black()));
        assert_eq!(Rgba::from_hex("#fff"), Some(Rgba::white()));
        assert_eq!(Rgba::from_hex("#ff000080"), Some(Rgba::new(255, 0, 0, 128)));
        assert_eq!(Rgba::from_hex("transparent"), Some(Rgba::transparent()));
        assert_eq!(Rgba::from_hex("red"), None);
        assert_eq!(Rgba::from_hex("#12"), None);
    }

    #[test]
    fn test_hex_formatting() {
        assert_eq!(Rgba::new(255, 0, 16, 255).to_hex(), "#ff0010");
        assert_eq!(Rgba::new(1, 2, 3, 4).to_hex(), "#01020304");
    }

    #[test]
    fn test_transparent_fill_is_no_fill() {
        let style = StrokeStyle::default().with_fill(Rgba::transparent());
        assert!(style.fill_color.is_none());

        let style = StrokeStyle::default().with_fill(Rgba::white());
        assert_eq!(style.fill_color, Some(Rgba::white()));
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let a = Operation::clear_marker(PageId(1), "alice");
        let b = Operation::clear_marker(PageId(1), "alice");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_serialized_field_names() {
        let op = Operation::shape(
            PageId(3),
            "alice",
            Tool::Rectangle,
            Point::new(10.0, 10.0),
            Point::new(50.0, 40.0),
            StrokeStyle::default().with_fill(Rgba::white()),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["pageId"], 3);
        assert_eq!(json["authorId"], "alice");
        assert_eq!(json["tool"], "rectangle");
        assert_eq!(json["lineWidth"], 3.0);
        assert!(json.get("fillColor").is_some());
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_validate_shape_needs_two_points() {
        let op = Operation::new(
            PageId(1),
            "bob",
            Tool::Circle,
            vec![Point::new(0.0, 0.0)],
            StrokeStyle::default(),
        );
        assert!(matches!(
            op.validate(),
            Err(InvalidOperation::TooFewPoints { needed: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let op = Operation::new(
            PageId(1),
            "bob",
            Tool::Pencil,
            vec![Point::new(f64::NAN, 0.0)],
            StrokeStyle::default(),
        );
        assert_eq!(op.validate(), Err(InvalidOperation::NonFiniteCoordinate));

        let op = Operation::new(
            PageId(1),
            "bob",
            Tool::Pencil,
            vec![Point::new(1.0, 1.0)],
            StrokeStyle::new(Rgba::black(), 0.0),
        );
        assert_eq!(op.validate(), Err(InvalidOperation::BadLineWidth(0.0)));

        let op = Operation::new(
            PageId(1),
            "bob",
            Tool::Text,
            vec![Point::new(1.0, 1.0)],
            StrokeStyle::default(),
        );
        assert_eq!(op.validate(), Err(InvalidOperation::MissingText));

        let op = Operation::text(PageId(1), "bob", Point::new(1.0, 1.0), "hi", StrokeStyle::default());
        assert!(op.validate().is_ok());
        assert!(Operation::clear_marker(PageId(1), "bob").validate().is_ok());
    }
}
