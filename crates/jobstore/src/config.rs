//! Loading the store configuration from disk.

use std::path::Path;

use tracing::warn;

use crate::error::JobStoreError;
use jobstore_config::{Config, ConfigLoader, ConfigValidator};

/// Load and validate a config file. Warnings are logged, errors returned.
pub fn load_config(path: &Path) -> Result<Config, JobStoreError> {
    let config = ConfigLoader::load(path)?;
    let warnings = ConfigValidator::validate(&config)?.into_result()?;
    for warning in warnings {
        warn!("Config {}: {}", warning.path, warning.message);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstore_config::{ConfigError, FileLayout};
    use tempfile::TempDir;

    #[test]
    fn test_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("jobstore.toml");
        std::fs::write(
            &path,
            "[store]\nstorage_dir = \"/var/lib/jobstore\"\nlayout = \"per_user\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.store.layout, FileLayout::PerUser);
    }

    #[test]
    fn test_load_config_rejects_invalid_file_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("jobstore.toml");
        std::fs::write(&path, "[store]\nfile_name = \"nested/jobs.bin\"\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/jobstore.toml")).unwrap_err();
        assert!(matches!(err, JobStoreError::Config(ConfigError::NotFound(_))));
    }
}
