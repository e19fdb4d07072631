//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating store configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("No config file at {0:?}")]
    NotFound(PathBuf),

    #[error("Malformed config: {0}")]
    InvalidFormat(String),

    /// A field failed validation.
    #[error("Bad value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },

    /// A `${VAR}` reference names an unset variable.
    #[error("`${{{0}}}` is referenced but not set")]
    EnvVarNotSet(String),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}
