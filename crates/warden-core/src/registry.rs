//! Pid-file backed registry of supervisor processes.
//!
//! The file holds comma-joined decimal pids, e.g. `4121,4187`. Its presence is
//! the only "running" signal: nothing checks whether the recorded processes
//! still exist.

use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use tracing::{debug, warn};

/// Errors from registry file access.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Reading, writing, or removing the file failed.
    #[error("registry file {path}: {source}")]
    Io {
        /// The registry file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Handle on one task's registry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// Wrap the registry file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the registry file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file exists, i.e. the task is considered running.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Raw file content; empty when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error for any I/O failure other than a missing file.
    pub fn read_raw(&self) -> Result<String, RegistryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    /// Recorded pids in file order. Missing file or empty content yields an
    /// empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read(&self) -> Result<Vec<Pid>, RegistryError> {
        Ok(parse_pids(&self.read_raw()?))
    }

    /// Append `pid` to the recorded list, creating the file (and its
    /// directory) when needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn append(&self, pid: Pid) -> Result<(), RegistryError> {
        let existing = self.read_raw()?;
        let existing = existing.trim();
        let content = if existing.is_empty() {
            pid.to_string()
        } else {
            format!("{existing},{pid}")
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        }
        std::fs::write(&self.path, content).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), %pid, "recorded supervisor pid");
        Ok(())
    }

    /// Read the recorded pids and delete the file.
    ///
    /// Returns `None` (and leaves the file untouched) when the file is missing
    /// or empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or removed.
    pub fn take(&self) -> Result<Option<Vec<Pid>>, RegistryError> {
        let content = self.read_raw()?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(source) => return Err(self.io_error(source)),
        }
        Ok(Some(parse_pids(&content)))
    }

    fn io_error(&self, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Parse comma-joined pids, skipping blanks. Entries that are not positive
/// integers are dropped: signalling pid 0 or a negative pid would hit a whole
/// process group.
#[must_use]
pub fn parse_pids(content: &str) -> Vec<Pid> {
    content
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<i32>() {
            Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
            _ => {
                warn!(entry, "ignoring malformed registry entry");
                None
            },
        })
        .collect()
}
