use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Creates the per-run scratch directory `<root>/<base>_work`.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    keep: bool,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, keep: bool) -> Self {
        Self {
            root: root.into(),
            keep,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, base_name: &str) -> PathBuf {
        self.root.join(format!("{}_work", base_name))
    }

    /// Remove any stale directory for `base_name` and create an empty one.
    pub fn prepare(&self, base_name: &str) -> Result<Workspace> {
        let path = self.path_for(base_name);

        if path.exists() {
            debug!(path = %path.display(), "removing stale workspace");
            std::fs::remove_dir_all(&path).map_err(|source| Error::Workspace {
                path: path.clone(),
                source,
            })?;
        }

        std::fs::create_dir_all(&path).map_err(|source| Error::Workspace {
            path: path.clone(),
            source,
        })?;

        Ok(Workspace::new(path, self.keep))
    }

    /// Hand back a previous run's directory untouched, if it holds unpacked content.
    pub fn reuse(&self, base_name: &str) -> Option<Workspace> {
        let path = self.path_for(base_name);
        if path.join("AndroidManifest.xml").is_file() {
            Some(Workspace::new(path, self.keep))
        } else {
            None
        }
    }
}

/// What happened to a workspace when its run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    Removed,
    Kept,
    Failed(String),
}

/// Exclusive handle on one run's scratch directory.
///
/// Dropping an unreleased workspace removes it, so a panicking run still
/// cleans up.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    keep: bool,
    released: bool,
}

impl Workspace {
    fn new(path: PathBuf, keep: bool) -> Self {
        Self {
            path,
            keep,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join("AndroidManifest.xml")
    }

    pub fn release(mut self) -> Release {
        self.released = true;
        if self.keep {
            return Release::Kept;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Release::Removed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Release::Removed,
            Err(e) => Release::Failed(e.to_string()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released || self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "could not remove workspace: {}", e);
            }
        }
    }
}
