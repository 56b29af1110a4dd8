//! Per-page operation log with a linear undo/redo cursor.
//!
//! Operations are only ever appended. Undo and redo move the activation
//! boundary (the cursor) without removing anything; appending while the cursor
//! is behind the tail drops the undone tail first, which is the usual
//! branch-overwrite rule of a linear history.

use serde::{Deserialize, Serialize};

use crate::operation::{Operation, OperationId, PageId};
use crate::render::{Surface, draw_operation};

/// How a page clear affects its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearPolicy {
    /// Drop every operation; the cleared strokes cannot be restored.
    #[default]
    Discard,
    /// Append a clear marker so that undo brings the strokes back.
    Marker,
}

/// The operation sequence and cursor for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "PageLogRepr", try_from = "PageLogRepr")]
pub struct PageLog {
    id: PageId,
    ops: Vec<Operation>,
    /// Number of active operations (`cursor + 1`).
    active: usize,
}

impl PageLog {
    /// Create an empty page (`ops = []`, cursor = -1).
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            ops: Vec::new(),
            active: 0,
        }
    }

    /// Build a page from loaded operations. Every operation is active.
    pub fn from_operations(id: PageId, ops: Vec<Operation>) -> Self {
        let active = ops.len();
        Self { id, ops, active }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Index of the last active operation, `None` when nothing is active.
    pub fn cursor(&self) -> Option<usize> {
        self.active.checked_sub(1)
    }

    /// All retained operations, including undone ones.
    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        self.active > 0
    }

    pub fn can_redo(&self) -> bool {
        self.active < self.ops.len()
    }

    /// Whether an operation with this id is retained (active or undone).
    pub fn contains(&self, id: OperationId) -> bool {
        self.ops.iter().any(|op| op.id() == id)
    }

    /// Append an operation, discarding any redo history first.
    pub fn append(&mut self, op: Operation) {
        self.ops.truncate(self.active);
        self.ops.push(op);
        self.active = self.ops.len();
    }

    /// Move the cursor back by one. Returns false if there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        if self.active == 0 {
            return false;
        }
        self.active -= 1;
        true
    }

    /// Move the cursor forward by one. Returns false if there is nothing to redo.
    pub fn redo(&mut self) -> bool {
        if self.active >= self.ops.len() {
            return false;
        }
        self.active += 1;
        true
    }

    /// Drop every operation. Nothing can be redone afterwards.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.active = 0;
    }

    /// Clear by appending a [`Tool::Clear`](crate::operation::Tool::Clear)
    /// marker, so that undo brings the strokes back.
    pub fn clear_with_marker(&mut self, marker: Operation) {
        self.append(marker);
    }

    /// Operations `0..=cursor`, in append order.
    pub fn active_operations(&self) -> &[Operation] {
        &self.ops[..self.active]
    }

    /// Active operations after the last active clear marker.
    ///
    /// This is what gets drawn; without markers it equals [`Self::active_operations`].
    pub fn visible_operations(&self) -> &[Operation] {
        let active = self.active_operations();
        match active.iter().rposition(Operation::is_clear_marker) {
            Some(idx) => &active[idx + 1..],
            None => active,
        }
    }

    /// Clear the surface and replay the visible operations in append order.
    pub fn render<S: Surface + ?Sized>(&self, surface: &mut S) {
        surface.clear();
        for op in self.visible_operations() {
            draw_operation(surface, op);
        }
    }
}

/// Serialized form: the cursor travels as a signed index so that -1 means empty.
#[derive(Serialize, Deserialize)]
struct PageLogRepr {
    id: PageId,
    #[serde(default)]
    ops: Vec<Operation>,
    cursor: i64,
}

impl From<PageLog> for PageLogRepr {
    fn from(log: PageLog) -> Self {
        Self {
            id: log.id,
            cursor: log.active as i64 - 1,
            ops: log.ops,
        }
    }
}

impl TryFrom<PageLogRepr> for PageLog {
    type Error = String;

    fn try_from(repr: PageLogRepr) -> Result<Self, Self::Error> {
        let len = repr.ops.len() as i64;
        if repr.cursor < -1 || repr.cursor >= len {
            return Err(format!(
                "cursor {} out of range for {} with {} operations",
                repr.cursor, repr.id, len
            ));
        }
        Ok(Self {
            id: repr.id,
            ops: repr.ops,
            active: (repr.cursor + 1) as usize,
        })
    }
}
