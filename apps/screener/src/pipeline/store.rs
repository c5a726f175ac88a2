//! State Store: durable JSON snapshot of the queue state.
//!
//! `save` writes the full snapshot to a temporary file in the target
//! directory, syncs it and renames it over the previous snapshot, so a reader
//! sees either the old or the new file, never a partial one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::pipeline::queues::QueueState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state writer task failed: {0}")]
    Writer(String),
}

/// Persistence seam used by the queue manager.
pub trait StateStore: Send + Sync {
    fn save(&self, state: &QueueState) -> Result<(), StoreError>;
    fn load(&self) -> Result<QueueState, StoreError>;
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Moves an unreadable snapshot aside so the next save does not clobber it.
    fn quarantine(&self, now: DateTime<Utc>) -> Option<PathBuf> {
        let file_name = self.path.file_name()?.to_string_lossy().into_owned();
        let target = self.path.with_file_name(format!(
            "{file_name}.corrupt-{}",
            now.format("%Y%m%dT%H%M%S")
        ));
        match fs::rename(&self.path, &target) {
            Ok(()) => Some(target),
            Err(e) => {
                warn!("Could not move corrupt state file aside: {e}");
                None
            }
        }
    }
}

impl StateStore for JsonFileStore {
    fn save(&self, state: &QueueState) -> Result<(), StoreError> {
        let dir = self.dir();
        fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;

        let bytes = serde_json::to_vec_pretty(state)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| self.io_err(e))?;
        tmp.write_all(&bytes).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }

    /// Missing file is a first start. A snapshot that does not parse is
    /// logged, moved aside, and replaced by an empty state.
    fn load(&self) -> Result<QueueState, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", self.path.display());
                return Ok(QueueState::default());
            }
            Err(e) => return Err(self.io_err(e)),
        };

        match serde_json::from_slice::<QueueState>(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                error!(
                    "State file {} is unreadable ({e}); starting from an empty state",
                    self.path.display()
                );
                if let Some(moved) = self.quarantine(Utc::now()) {
                    warn!("Corrupt state preserved at {}", moved.display());
                }
                Ok(QueueState::default())
            }
        }
    }
}
