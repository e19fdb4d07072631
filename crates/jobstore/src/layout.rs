//! Names of the files the store owns inside its storage directory.
//!
//! ```text
//! {storage_dir}/
//! ├── jobs.bin          single layout
//! ├── jobs.u0.bin       per-user layout, one file per user
//! └── jobs.u10.bin
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A store-owned file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFile {
    pub path: PathBuf,
    /// Owning user for per-user files, `None` for the single file.
    pub user: Option<u32>,
}

impl OwnedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// File naming for one storage directory.
#[derive(Debug, Clone)]
pub struct StoreFiles {
    dir: PathBuf,
    file_name: String,
    stem: String,
    extension: Option<String>,
}

impl StoreFiles {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let path = Path::new(&file_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
        Self {
            dir: dir.into(),
            file_name,
            stem,
            extension,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Name of the single-layout file.
    pub fn canonical_name(&self) -> &str {
        &self.file_name
    }

    /// Name of a user's file in the per-user layout.
    pub fn user_file_name(&self, user: u32) -> String {
        match &self.extension {
            Some(ext) => format!("{}.u{}.{}", self.stem, user, ext),
            None => format!("{}.u{}", self.stem, user),
        }
    }

    /// Parse the user out of a per-user file name.
    pub fn parse_user_file_name(&self, name: &str) -> Option<u32> {
        let rest = name.strip_prefix(&self.stem)?.strip_prefix(".u")?;
        let digits = match &self.extension {
            Some(ext) => rest.strip_suffix(ext.as_str())?.strip_suffix('.')?,
            None => rest,
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    fn classify(&self, name: &str) -> Option<Option<u32>> {
        if name == self.file_name {
            return Some(None);
        }
        self.parse_user_file_name(name).map(Some)
    }

    /// Store-owned files currently present, sorted by name.
    pub fn list_existing(&self) -> io::Result<Vec<OwnedFile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(user) = self.classify(name) {
                files.push(OwnedFile {
                    path: entry.path(),
                    user,
                });
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}
