//! Serialized session state.
//!
//! Two shapes exist:
//! - [`SessionSnapshot`]: the live state handed to late joiners, including redo
//!   history and the relay sequence number it reflects.
//! - [`BoardExport`]: the persisted `{ slides: [{ id, data }], createdAt }`
//!   format. Only active operations are written, so a loaded page never has
//!   redo history.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::operation::{Operation, OperationId, PageId, now_millis};
use crate::overlay::{OverlayElement, OverlayStore};
use crate::page_log::PageLog;
use crate::session::Session;

/// Reasons a snapshot cannot be installed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot has no pages")]
    NoPages,
    #[error("active page index {index} out of range for {len} pages")]
    ActiveOutOfRange { index: usize, len: usize },
    #[error("duplicate page id {0}")]
    DuplicatePage(PageId),
    #[error("operation {0} appears more than once")]
    DuplicateOperation(OperationId),
}

/// Full live state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub pages: Vec<PageLog>,
    pub active_page_index: usize,
    #[serde(default)]
    pub overlays: Vec<OverlayElement>,
    /// Relay sequence number of the last event reflected in this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// One persisted page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slide {
    pub id: PageId,
    #[serde(default)]
    pub data: Vec<Operation>,
}

/// Persisted board state, consumed by save/load collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardExport {
    pub slides: Vec<Slide>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub active_page_index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlays: Vec<OverlayElement>,
}

impl BoardExport {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn check_unique(ids: impl IntoIterator<Item = PageId>) -> Result<(), SnapshotError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(SnapshotError::DuplicatePage(id));
        }
    }
    Ok(())
}

fn check_unique_operations<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Result<(), SnapshotError> {
    let mut seen = HashSet::new();
    for op in ops {
        if !seen.insert(op.id()) {
            return Err(SnapshotError::DuplicateOperation(op.id()));
        }
    }
    Ok(())
}

/// Overlays whose page exists. Others are dropped.
fn attached_overlays(pages: &[PageLog], overlays: Vec<OverlayElement>) -> OverlayStore {
    OverlayStore::from_elements(
        overlays
            .into_iter()
            .filter(|e| pages.iter().any(|p| p.id() == e.page_id)),
    )
}

impl Session {
    /// Capture the live state for a late joiner.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            pages: self.pages.clone(),
            active_page_index: self.active,
            overlays: self.overlays.all().to_vec(),
            seq: None,
        }
    }

    /// Rebuild a session from a live snapshot. The clear policy is not part of
    /// the snapshot and is taken from `self`.
    pub fn restore(&self, snapshot: SessionSnapshot) -> Result<Session, SnapshotError> {
        if snapshot.pages.is_empty() {
            return Err(SnapshotError::NoPages);
        }
        if snapshot.active_page_index >= snapshot.pages.len() {
            return Err(SnapshotError::ActiveOutOfRange {
                index: snapshot.active_page_index,
                len: snapshot.pages.len(),
            });
        }
        check_unique(snapshot.pages.iter().map(PageLog::id))?;
        check_unique_operations(snapshot.pages.iter().flat_map(|p| p.operations()))?;

        Ok(Session {
            overlays: attached_overlays(&snapshot.pages, snapshot.overlays),
            pages: snapshot.pages,
            active: snapshot.active_page_index,
            clear_policy: self.clear_policy,
        })
    }

    /// Export the persisted form. Each slide holds the page's active operations.
    pub fn export(&self) -> BoardExport {
        BoardExport {
            slides: self
                .pages
                .iter()
                .map(|page| Slide {
                    id: page.id(),
                    data: page.active_operations().to_vec(),
                })
                .collect(),
            created_at: now_millis(),
            active_page_index: self.active,
            overlays: self.overlays.all().to_vec(),
        }
    }

    /// Load the persisted form. Every page comes back with `cursor = len(data) - 1`.
    ///
    /// An export without slides loads as a fresh single-page session; an out of
    /// range active index falls back to the first page.
    pub fn from_export(export: BoardExport) -> Result<Session, SnapshotError> {
        check_unique(export.slides.iter().map(|s| s.id))?;
        check_unique_operations(export.slides.iter().flat_map(|s| &s.data))?;

        let mut session = Session::new();
        if export.slides.is_empty() {
            return Ok(session);
        }

        session.pages = export
            .slides
            .into_iter()
            .map(|slide| PageLog::from_operations(slide.id, slide.data))
            .collect();
        session.active = if export.active_page_index < session.pages.len() {
            export.active_page_index
        } else {
            0
        };
        session.overlays = attached_overlays(&session.pages, export.overlays);
        Ok(session)
    }
}
