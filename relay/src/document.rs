//! The relay's durable copy of the scene document.

use log::{debug, info};
use shared::error::DocumentError;
use shared::{SceneDocument, StoreWrite};
use std::path::{Path, PathBuf};

/// Authoritative scene document with last-writer-wins writes and optional
/// JSON persistence.
pub struct DocumentStore {
    document: SceneDocument,
    revision: u64,
    path: Option<PathBuf>,
    dirty: bool,
}

impl DocumentStore {
    pub fn new(document: SceneDocument) -> Self {
        Self {
            document,
            revision: 0,
            path: None,
            dirty: false,
        }
    }

    /// Loads the document to serve.
    ///
    /// A previously saved document at `save_path` wins over the pristine
    /// `level` file so that state survives relay restarts.
    pub fn open(level: Option<&Path>, save_path: Option<PathBuf>) -> Result<Self, DocumentError> {
        let document = match (&save_path, level) {
            (Some(saved), _) if saved.exists() => {
                info!("Resuming scene document from {}", saved.display());
                SceneDocument::load(saved)?
            }
            (_, Some(level)) => {
                info!("Loading level from {}", level.display());
                SceneDocument::load(level)?
            }
            _ => {
                info!("Starting with an empty scene document");
                SceneDocument::default()
            }
        };

        let mut store = Self::new(document);
        store.path = save_path;
        Ok(store)
    }

    pub fn document(&self) -> &SceneDocument {
        &self.document
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Applies a participant's write. Returns the new revision, or None if
    /// the write changed nothing.
    pub fn apply(&mut self, write: &StoreWrite) -> Option<u64> {
        if !self.document.apply(write) {
            return None;
        }
        self.revision += 1;
        self.dirty = true;
        Some(self.revision)
    }

    /// Writes the document to disk if it changed since the last save.
    /// Returns whether anything was written.
    pub fn save(&mut self) -> Result<bool, DocumentError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }

        std::fs::write(path, self.document.to_json()?)?;
        self.dirty = false;
        debug!("Saved scene document revision {} to {}", self.revision, path.display());
        Ok(true)
    }
}
