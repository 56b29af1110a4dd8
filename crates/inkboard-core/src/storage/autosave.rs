//! Periodic saving of the local board.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Storage, StorageError, StorageResult};
use crate::session::Session;

pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Board id used until the host picks one.
pub const DEFAULT_BOARD_ID: &str = "untitled";

/// Key holding a copy of the most recently saved board.
pub const LAST_BOARD_KEY: &str = "__last_board__";

/// Saves a session at most once per interval, and only when it changed.
pub struct AutoSaveManager<S: Storage> {
    storage: Arc<S>,
    interval: Duration,
    last_save: Option<Instant>,
    dirty: bool,
    board_id: String,
}

impl<S: Storage> AutoSaveManager<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            last_save: None,
            dirty: false,
            board_id: DEFAULT_BOARD_ID.to_string(),
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn set_board_id(&mut self, id: impl Into<String>) {
        self.board_id = id.into();
    }

    /// Dirty, and the interval has elapsed since the last save.
    pub fn should_save(&self) -> bool {
        self.dirty && self.last_save.is_none_or(|t| t.elapsed() >= self.interval)
    }

    /// Save if [`Self::should_save`]. Returns whether a save happened.
    pub async fn maybe_save(&mut self, session: &Session) -> StorageResult<bool> {
        if !self.should_save() {
            return Ok(false);
        }
        self.save(session).await?;
        Ok(true)
    }

    /// Save now under the current board id and as the last board.
    pub async fn save(&mut self, session: &Session) -> StorageResult<()> {
        let board = session.export();
        self.storage.save(&self.board_id, &board).await?;
        self.storage.save(LAST_BOARD_KEY, &board).await?;
        self.dirty = false;
        self.last_save = Some(Instant::now());
        log::debug!("Auto-saved board {}", self.board_id);
        Ok(())
    }

    /// Load a board and make it the current one.
    pub async fn load(&mut self, id: &str) -> StorageResult<Session> {
        let board = self.storage.load(id).await?;
        let session = Session::from_export(board).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.board_id = id.to_string();
        self.dirty = false;
        Ok(session)
    }

    /// The most recently saved board, if any.
    pub async fn load_last(&self) -> StorageResult<Option<Session>> {
        match self.storage.load(LAST_BOARD_KEY).await {
            Ok(board) => Session::from_export(board)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        self.storage.delete(id).await
    }

    /// Saved board ids, without the last-board copy.
    pub async fn list_boards(&self) -> StorageResult<Vec<String>> {
        let mut ids = self.storage.list().await?;
        ids.retain(|id| id != LAST_BOARD_KEY);
        Ok(ids)
    }

    pub async fn exists(&self, id: &str) -> StorageResult<bool> {
        self.storage.exists(id).await
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}
