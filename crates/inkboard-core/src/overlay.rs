//! Free-floating elements (images, text blocks, sticky notes) layered over a page.
//!
//! Overlays live outside the operation log: they are moved and edited in place
//! and removed immediately. None of it is covered by undo/redo.

use kurbo::{Point, Size};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{AuthorId, PageId, Rgba};

/// Unique identifier for an overlay element.
pub type OverlayId = Uuid;

/// Kind of overlay element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayKind {
    Image,
    Text,
    Sticky,
}

/// A draggable, non-stroke object on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayElement {
    pub id: OverlayId,
    pub page_id: PageId,
    pub kind: OverlayKind,
    /// Top-left corner in canvas coordinates.
    pub position: Point,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    /// Image URL or text body, depending on `kind`.
    pub content: String,
    /// Text color, or background color for sticky notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgba>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    pub author_id: AuthorId,
}

impl OverlayElement {
    /// Default sticky note dimensions.
    pub const STICKY_SIZE: Size = Size::new(200.0, 150.0);
    /// Images wider than this are scaled down on insert.
    pub const MAX_IMAGE_WIDTH: f64 = 300.0;

    fn new(
        page_id: PageId,
        kind: OverlayKind,
        position: Point,
        content: String,
        author_id: AuthorId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            page_id,
            kind,
            position,
            size: None,
            content,
            color: None,
            font_size: None,
            author_id,
        }
    }

    /// An image scaled to at most [`Self::MAX_IMAGE_WIDTH`], keeping its aspect ratio.
    pub fn image(
        page_id: PageId,
        author_id: impl Into<AuthorId>,
        position: Point,
        url: impl Into<String>,
        natural_size: Size,
    ) -> Self {
        let size = if natural_size.width > Self::MAX_IMAGE_WIDTH {
            let scale = Self::MAX_IMAGE_WIDTH / natural_size.width;
            Size::new(Self::MAX_IMAGE_WIDTH, natural_size.height * scale)
        } else {
            natural_size
        };
        let mut element = Self::new(page_id, OverlayKind::Image, position, url.into(), author_id.into());
        element.size = Some(size);
        element
    }

    pub fn text(
        page_id: PageId,
        author_id: impl Into<AuthorId>,
        position: Point,
        text: impl Into<String>,
        color: Rgba,
        font_size: f64,
    ) -> Self {
        let mut element = Self::new(page_id, OverlayKind::Text, position, text.into(), author_id.into());
        element.color = Some(color);
        element.font_size = Some(font_size);
        element
    }

    pub fn sticky(
        page_id: PageId,
        author_id: impl Into<AuthorId>,
        position: Point,
        text: impl Into<String>,
        background: Rgba,
    ) -> Self {
        let mut element = Self::new(page_id, OverlayKind::Sticky, position, text.into(), author_id.into());
        element.size = Some(Self::STICKY_SIZE);
        element.color = Some(background);
        element
    }
}

/// Overlay elements of every page, in insertion (stacking) order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OverlayStore {
    elements: Vec<OverlayElement>,
}

impl OverlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from previously saved elements, dropping duplicate ids.
    pub fn from_elements(elements: impl IntoIterator<Item = OverlayElement>) -> Self {
        let mut store = Self::new();
        for element in elements {
            store.add(element);
        }
        store
    }

    /// Add an element. Returns false (and keeps the existing one) if the id is taken.
    pub fn add(&mut self, element: OverlayElement) -> bool {
        if self.get(element.id).is_some() {
            return false;
        }
        self.elements.push(element);
        true
    }

    /// Move an element. Returns false if the id is unknown.
    pub fn move_to(&mut self, id: OverlayId, position: Point) -> bool {
        match self.get_mut(id) {
            Some(element) => {
                element.position = position;
                true
            }
            None => false,
        }
    }

    /// Replace the editable fields (content, size, color, font size, position) of an element.
    pub fn update(&mut self, updated: &OverlayElement) -> bool {
        match self.get_mut(updated.id) {
            Some(element) => {
                element.position = updated.position;
                element.size = updated.size;
                element.content.clone_from(&updated.content);
                element.color = updated.color;
                element.font_size = updated.font_size;
                true
            }
            None => false,
        }
    }

    /// Remove an element. Unknown ids are treated as already deleted.
    pub fn remove(&mut self, id: OverlayId) -> Option<OverlayElement> {
        let idx = self.elements.iter().position(|e| e.id == id)?;
        Some(self.elements.remove(idx))
    }

    /// Elements on a page, bottom to top.
    pub fn list(&self, page_id: PageId) -> impl Iterator<Item = &OverlayElement> {
        self.elements.iter().filter(move |e| e.page_id == page_id)
    }

    pub fn get(&self, id: OverlayId) -> Option<&OverlayElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    fn get_mut(&mut self, id: OverlayId) -> Option<&mut OverlayElement> {
        self.elements.iter_mut().find(|e| e.id == id)
    }

    /// Drop every element on a page. Returns how many were removed.
    pub fn clear_page(&mut self, page_id: PageId) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| e.page_id != page_id);
        before - self.elements.len()
    }

    /// All elements of all pages.
    pub fn all(&self) -> &[OverlayElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(page: u64) -> OverlayElement {
        OverlayElement::sticky(PageId(page), "alice", Point::new(10.0, 20.0), "todo", Rgba::new(255, 235, 59, 255))
    }

    #[test]
    fn test_add_and_list_per_page() {
        let mut store = OverlayStore::new();
        let a = note(1);
        let b = note(2);
        let c = note(1);
        assert!(store.add(a.clone()));
        assert!(store.add(b.clone()));
        assert!(store.add(c.clone()));

        let page1: Vec<_> = store.list(PageId(1)).map(|e| e.id).collect();
        assert_eq!(page1, vec![a.id, c.id]);
        assert_eq!(store.list(PageId(2)).count(), 1);
        assert_eq!(store.list(PageId(3)).count(), 0);
    }

    #[test]
    fn test_duplicate_add_keeps_original() {
        let mut store = OverlayStore::new();
        let a = note(1);
        store.add(a.clone());

        let mut dup = a.clone();
        dup.content = "changed".to_string();
        assert!(!store.add(dup));
        assert_eq!(store.get(a.id).unwrap().content, "todo");
    }

    #[test]
    fn test_move_in_place() {
        let mut store = OverlayStore::new();
        let a = note(1);
        store.add(a.clone());

        assert!(store.move_to(a.id, Point::new(99.0, 42.0)));
        assert_eq!(store.get(a.id).unwrap().position, Point::new(99.0, 42.0));
        assert!(!store.move_to(Uuid::new_v4(), Point::ZERO));
    }

    #[test]
    fn test_update_content() {
        let mut store = OverlayStore::new();
        let a = note(1);
        store.add(a.clone());

        let mut edited = a.clone();
        edited.content = "done".to_string();
        edited.page_id = PageId(9);
        assert!(store.update(&edited));
        let stored = store.get(a.id).unwrap();
        assert_eq!(stored.content, "done");
        assert_eq!(stored.page_id, PageId(1), "update never moves an element between pages");
    }

    #[test]
    fn test_remove_unknown_is_silent() {
        let mut store = OverlayStore::new();
        let a = note(1);
        store.add(a.clone());

        assert!(store.remove(a.id).is_some());
        assert!(store.remove(a.id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_page() {
        let mut store = OverlayStore::new();
        store.add(note(1));
        store.add(note(1));
        store.add(note(2));

        assert_eq!(store.clear_page(PageId(1)), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_image_is_scaled_down() {
        let img = OverlayElement::image(PageId(1), "a", Point::ZERO, "https://example.com/a.png", Size::new(600.0, 400.0));
        assert_eq!(img.size, Some(Size::new(300.0, 200.0)));

        let img = OverlayElement::image(PageId(1), "a", Point::ZERO, "https://example.com/b.png", Size::new(100.0, 50.0));
        assert_eq!(img.size, Some(Size::new(100.0, 50.0)));
    }
}
