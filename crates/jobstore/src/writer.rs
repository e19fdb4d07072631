//! Atomic replacement of persisted files.
//!
//! Each write goes to a temporary sibling, is synced to stable storage, and
//! is then renamed over the canonical name. A reader sees either the old file
//! or the new one, never a partial write.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::JobStoreError;

/// Crash-safe writer for files inside one directory.
#[derive(Debug)]
pub struct DiskWriter {
    dir: PathBuf,
    #[cfg(test)]
    fail_before_rename: std::sync::atomic::AtomicBool,
}

impl DiskWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            #[cfg(test)]
            fail_before_rename: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Atomically replace `file_name` with `data`.
    pub fn write(&self, file_name: &str, data: &[u8]) -> Result<(), JobStoreError> {
        let path = self.dir.join(file_name);
        let fail = |e: io::Error| JobStoreError::persistence(&path, e);

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(fail)?;

        temp.write_all(data).map_err(fail)?;
        temp.as_file().sync_all().map_err(fail)?;

        self.injected_failure().map_err(fail)?;

        temp.persist(&path).map_err(|e| fail(e.error))?;
        self.sync_dir().map_err(fail)?;

        debug!("Wrote {} bytes to {:?}", data.len(), path);
        Ok(())
    }

    /// Remove `file_name`; a missing file is not an error.
    pub fn remove(&self, file_name: &str) -> Result<(), JobStoreError> {
        let path = self.dir.join(file_name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed stale job file {:?}", path);
                self.sync_dir()
                    .map_err(|e| JobStoreError::persistence(&path, e))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobStoreError::persistence(&path, e)),
        }
    }

    // Make the rename itself durable.
    #[cfg(unix)]
    fn sync_dir(&self) -> io::Result<()> {
        fs::File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn injected_failure(&self) -> io::Result<()> {
        if self
            .fail_before_rename
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(io::Error::other("injected failure before rename"));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_failure_before_rename(&self, fail: bool) {
        self.fail_before_rename
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}
