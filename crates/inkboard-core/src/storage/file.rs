//! Board storage in a directory of JSON files.

use std::fs;
use std::path::{Path, PathBuf};

use super::{BoxFuture, Storage, StorageError, StorageResult};
use crate::snapshot::BoardExport;

const EXTENSION: &str = "json";

/// Stores each board as `<id>.json` under a base directory.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    /// Use `base_path`, creating it if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::Io(format!("Failed to create {}: {e}", base_path.display())))?;
        Ok(Self { base_path })
    }

    /// Per-user data directory: `<data dir>/inkboard/boards`.
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Other("No data directory available".to_string()))?;
        Self::new(base.join("inkboard").join("boards"))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// File path for a board id. Characters outside `[A-Za-z0-9_-]` become `_`.
    fn board_path(&self, id: &str) -> PathBuf {
        let name: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{name}.{EXTENSION}"))
    }
}

impl Storage for FileStorage {
    fn save(&self, id: &str, board: &BoardExport) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.board_path(id);
        let json = board.to_json();
        Box::pin(async move {
            let json = json.map_err(|e| StorageError::Serialization(e.to_string()))?;
            // Write then rename, so a crash never leaves a truncated board.
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json).map_err(|e| StorageError::Io(e.to_string()))?;
            fs::rename(&tmp, &path).map_err(|e| StorageError::Io(e.to_string()))?;
            log::debug!("Saved board to {}", path.display());
            Ok(())
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<BoardExport>> {
        let id = id.to_string();
        let path = self.board_path(&id);
        Box::pin(async move {
            let json = match fs::read_to_string(&path) {
                Ok(json) => json,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StorageError::NotFound(id)),
                Err(e) => return Err(StorageError::Io(e.to_string())),
            };
            BoardExport::from_json(&json).map_err(|e| StorageError::Serialization(e.to_string()))
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.board_path(id);
        Box::pin(async move {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e.to_string())),
            }
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let entries = fs::read_dir(&self.base_path).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut ids = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| StorageError::Io(e.to_string()))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
            Ok(ids)
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let path = self.board_path(id);
        Box::pin(async move { Ok(path.is_file()) })
    }
}
