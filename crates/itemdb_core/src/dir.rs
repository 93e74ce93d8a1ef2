//! Store directory management.
//!
//! A file-backed store owns a directory with this layout:
//!
//! ```text
//! <store_path>/
//! ├─ db.sqlite         # The database file
//! ├─ files/            # User-visible attachments (path attributes)
//! ├─ temp/             # Staging area for atomic writes
//! └─ run/              # Pid/log files for host integration
//! ```
//!
//! Path attributes store paths relative to `files/`, always with `/` as
//! the separator regardless of host OS.

use crate::error::{EngineError, EngineResult};
use std::fs;
use std::path::{Path, PathBuf};

const DB_FILE: &str = "db.sqlite";
const FILES_DIR: &str = "files";
const TEMP_DIR: &str = "temp";
const RUN_DIR: &str = "run";

/// Manages the directory tree around a file-backed store.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
}

impl StoreDir {
    /// Opens or creates the directory tree.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Misuse`] if the directory is missing and
    /// `create_if_missing` is false, if it exists and `error_if_exists` is
    /// true, or if the path is not a directory.
    pub fn open(path: &Path, create_if_missing: bool, error_if_exists: bool) -> EngineResult<Self> {
        let exists = path.join(DB_FILE).exists();
        if exists && error_if_exists {
            return Err(EngineError::misuse(format!(
                "store already exists at {}",
                path.display()
            )));
        }
        if !path.exists() {
            if !create_if_missing {
                return Err(EngineError::misuse(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path).map_err(io_misuse)?;
        }
        if !path.is_dir() {
            return Err(EngineError::misuse(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }
        for sub in [FILES_DIR, TEMP_DIR, RUN_DIR] {
            fs::create_dir_all(path.join(sub)).map_err(io_misuse)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Returns the store root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the database file path.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.path.join(DB_FILE)
    }

    /// Returns the attachments directory.
    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.path.join(FILES_DIR)
    }

    /// Returns the staging directory for atomic writes.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.path.join(TEMP_DIR)
    }

    /// Returns the run directory for host integration files.
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.path.join(RUN_DIR)
    }

    /// Resolves a store-relative path (as held by a path attribute) to an
    /// absolute path under `files/`.
    ///
    /// The relative path uses `/` separators on every platform.
    #[must_use]
    pub fn file_path(&self, relative: &str) -> PathBuf {
        let mut out = self.files_dir();
        for component in relative.split('/') {
            out.push(component);
        }
        out
    }

    /// Writes an attachment atomically: stage in `temp/`, then rename into
    /// place under `files/`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Misuse`] wrapping the I/O failure.
    pub fn write_file(&self, relative: &str, contents: &[u8]) -> EngineResult<PathBuf> {
        let target = self.file_path(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_misuse)?;
        }
        let staged = self
            .temp_dir()
            .join(format!("stage-{}", relative.replace('/', "-")));
        fs::write(&staged, contents).map_err(io_misuse)?;
        fs::rename(&staged, &target).map_err(io_misuse)?;
        Ok(target)
    }
}

fn io_misuse(err: std::io::Error) -> EngineError {
    EngineError::misuse(format!("store directory I/O failure: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("store");
        let dir = StoreDir::open(&root, true, false).unwrap();

        assert!(dir.files_dir().is_dir());
        assert!(dir.temp_dir().is_dir());
        assert!(dir.run_dir().is_dir());
        assert_eq!(dir.db_path(), root.join("db.sqlite"));
    }

    #[test]
    fn open_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = StoreDir::open(&temp.path().join("missing"), false, false);
        assert!(result.is_err());
    }

    #[test]
    fn file_path_splits_on_slash() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true, false).unwrap();
        let resolved = dir.file_path("a/b/c.txt");
        assert!(resolved.ends_with(Path::new("files").join("a").join("b").join("c.txt")));
    }

    #[test]
    fn write_file_is_visible_at_target() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true, false).unwrap();
        let written = dir.write_file("notes/hello.txt", b"hi").unwrap();
        assert_eq!(fs::read(written).unwrap(), b"hi");
        // Nothing left behind in the staging area.
        assert_eq!(fs::read_dir(dir.temp_dir()).unwrap().count(), 0);
    }
}
