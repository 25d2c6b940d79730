//! Zero-byte sentinel files used as one-shot signals between invocations.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Present means pending; consuming reads and deletes it in one step.
#[derive(Debug, Clone)]
pub struct Marker {
    path: PathBuf,
}

impl Marker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&self.path)?;
        debug!(marker = %self.path.display(), "marked");
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.path.is_file()
    }

    /// Returns whether the marker was pending. Of several concurrent
    /// callers at most one observes `true`.
    pub fn consume(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(marker = %self.path.display(), "consumed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
