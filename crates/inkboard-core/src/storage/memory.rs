//! In-memory board storage.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{BoxFuture, Storage, StorageError, StorageResult};
use crate::snapshot::BoardExport;

/// Keeps boards in a map. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    boards: RwLock<HashMap<String, BoardExport>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_error<T>(err: PoisonError<T>) -> StorageError {
        StorageError::Other(format!("Lock error: {err}"))
    }
}

impl Storage for MemoryStorage {
    fn save(&self, id: &str, board: &BoardExport) -> BoxFuture<'_, StorageResult<()>> {
        let id = id.to_string();
        let board = board.clone();
        Box::pin(async move {
            self.boards.write().map_err(Self::lock_error)?.insert(id, board);
            Ok(())
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<BoardExport>> {
        let id = id.to_string();
        Box::pin(async move {
            let boards = self.boards.read().map_err(Self::lock_error)?;
            boards.get(&id).cloned().ok_or(StorageError::NotFound(id))
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.boards.write().map_err(Self::lock_error)?.remove(&id);
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let boards = self.boards.read().map_err(Self::lock_error)?;
            Ok(boards.keys().cloned().collect())
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.boards.read().map_err(Self::lock_error)?.contains_key(&id)) })
    }
}
