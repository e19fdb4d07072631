//! Configuration validation.

use std::path::Path;

use crate::error::ConfigError;
use crate::schema::{Config, FileLayout};

const KNOWN_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LONG_WRITE_DELAY_MS: u64 = 60 * 60 * 1000;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Turn the first error into a [`ConfigError`], if any.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(ConfigError::InvalidValue {
                field: error.path,
                message: error.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_store(config, &mut result);
        Self::validate_logging(config, &mut result);

        Ok(result)
    }

    fn validate_store(config: &Config, result: &mut ValidationResult) {
        let store = &config.store;

        if store.file_name.is_empty() {
            result.add_error(ValidationError::new(
                "store.file_name",
                "file_name cannot be empty",
            ));
        } else if store.file_name.contains(['/', '\\']) || store.file_name.starts_with('.') {
            result.add_error(ValidationError::new(
                "store.file_name",
                "file_name must be a plain file name inside storage_dir",
            ));
        } else if store.layout == FileLayout::PerUser
            && Path::new(&store.file_name).extension().is_none()
        {
            result.add_error(ValidationError::new(
                "store.file_name",
                "per_user layout needs a file_name with an extension",
            ));
        }

        if store.storage_dir.is_relative() {
            result.add_warning(ValidationWarning::new(
                "store.storage_dir",
                format!(
                    "storage_dir {:?} is relative, it resolves against the working directory",
                    store.storage_dir
                ),
            ));
        }

        if store.write_delay_ms > LONG_WRITE_DELAY_MS {
            result.add_warning(ValidationWarning::new(
                "store.write_delay_ms",
                "write_delay_ms is over an hour, pending changes may be lost on a crash",
            ));
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        let level = config.logging.level.to_ascii_lowercase();
        if !level.contains('=') && !KNOWN_LOG_LEVELS.contains(&level.as_str()) {
            result.add_warning(ValidationWarning::new(
                "logging.level",
                format!(
                    "Unknown log level '{}', valid values: {:?}",
                    config.logging.level, KNOWN_LOG_LEVELS
                ),
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
