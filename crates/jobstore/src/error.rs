//! Job store errors.

use std::path::PathBuf;

use thiserror::Error;

use jobstore_config::ConfigError;

/// Job store error types.
#[derive(Debug, Error)]
pub enum JobStoreError {
    /// Persisted file is unparseable or carries an unknown version.
    #[error("Format error: {0}")]
    Format(String),

    /// Writing the persisted file failed; nothing on disk changed.
    #[error("Persistence error on {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Rejected ingest input; the store is unchanged.
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO error outside the atomic write path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging could not be initialized.
    #[error("Logging error: {0}")]
    Logging(String),
}

impl JobStoreError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// True for errors that leave the store dirty and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Io(_))
    }
}

/// A record skipped while loading; the rest of the file still loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationWarning {
    /// File the record came from.
    pub file: PathBuf,
    /// Position of the record within the file.
    pub index: usize,
    /// Why it was skipped.
    pub reason: String,
}

impl std::fmt::Display for ReconciliationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "skipped record #{} in {:?}: {}",
            self.index, self.file, self.reason
        )
    }
}
