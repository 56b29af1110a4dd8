//! Board session: ordered pages plus the active page and the overlay layer.

use thiserror::Error;

use crate::operation::PageId;
use crate::overlay::OverlayStore;
use crate::page_log::{ClearPolicy, PageLog};

/// Page lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("page index {index} out of range (session has {len} pages)")]
    OutOfRange { index: usize, len: usize },
    #[error("cannot delete the only page")]
    LastPage,
}

/// Ordered collection of pages. Never empty; the active index is always valid.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub(crate) pages: Vec<PageLog>,
    pub(crate) active: usize,
    pub(crate) overlays: OverlayStore,
    pub(crate) clear_policy: ClearPolicy,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Id of the page every new session starts with.
    pub const FIRST_PAGE: PageId = PageId(1);

    /// Create a session with a single empty page.
    pub fn new() -> Self {
        Self {
            pages: vec![PageLog::new(Self::FIRST_PAGE)],
            active: 0,
            overlays: OverlayStore::new(),
            clear_policy: ClearPolicy::default(),
        }
    }

    pub fn with_clear_policy(mut self, policy: ClearPolicy) -> Self {
        self.clear_policy = policy;
        self
    }

    pub fn clear_policy(&self) -> ClearPolicy {
        self.clear_policy
    }

    pub fn set_clear_policy(&mut self, policy: ClearPolicy) {
        self.clear_policy = policy;
    }

    // --- Pages ---

    pub fn pages(&self) -> &[PageLog] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active_page(&self) -> &PageLog {
        &self.pages[self.active]
    }

    pub fn active_page_mut(&mut self) -> &mut PageLog {
        &mut self.pages[self.active]
    }

    pub fn page(&self, id: PageId) -> Option<&PageLog> {
        self.pages.iter().find(|p| p.id() == id)
    }

    pub fn page_mut(&mut self, id: PageId) -> Option<&mut PageLog> {
        self.pages.iter_mut().find(|p| p.id() == id)
    }

    pub fn page_at(&self, index: usize) -> Option<&PageLog> {
        self.pages.get(index)
    }

    pub fn index_of(&self, id: PageId) -> Option<usize> {
        self.pages.iter().position(|p| p.id() == id)
    }

    /// Next unused page id (one past the largest in use).
    pub fn next_page_id(&self) -> PageId {
        let max = self.pages.iter().map(|p| p.id().0).max().unwrap_or(0);
        PageId(max + 1)
    }

    /// Append an empty page, make it active and return its id.
    pub fn add_page(&mut self) -> PageId {
        let id = self.next_page_id();
        self.pages.push(PageLog::new(id));
        self.active = self.pages.len() - 1;
        id
    }

    /// Append an empty page with a given id and make it active.
    ///
    /// Returns false if the id is already in use; concurrent adds of the same id
    /// by two participants collapse into one page.
    pub fn insert_page(&mut self, id: PageId) -> bool {
        if self.page(id).is_some() {
            return false;
        }
        self.pages.push(PageLog::new(id));
        self.active = self.pages.len() - 1;
        true
    }

    /// Make the page at `index` active.
    pub fn switch_page(&mut self, index: usize) -> Result<(), SessionError> {
        self.check_index(index)?;
        self.active = index;
        Ok(())
    }

    /// Remove the page at `index` along with its overlays.
    ///
    /// The active page stays the same unless it was the deleted one, in which
    /// case the previous page becomes active.
    pub fn delete_page(&mut self, index: usize) -> Result<PageLog, SessionError> {
        self.check_index(index)?;
        if self.pages.len() == 1 {
            return Err(SessionError::LastPage);
        }

        let removed = self.pages.remove(index);
        self.overlays.clear_page(removed.id());

        if index < self.active || (index == self.active && self.active > 0) {
            self.active -= 1;
        }
        self.active = self.active.min(self.pages.len() - 1);
        Ok(removed)
    }

    fn check_index(&self, index: usize) -> Result<(), SessionError> {
        if index < self.pages.len() {
            Ok(())
        } else {
            Err(SessionError::OutOfRange {
                index,
                len: self.pages.len(),
            })
        }
    }

    // --- Overlays ---

    pub fn overlays(&self) -> &OverlayStore {
        &self.overlays
    }

    pub fn overlays_mut(&mut self) -> &mut OverlayStore {
        &mut self.overlays
    }
}
