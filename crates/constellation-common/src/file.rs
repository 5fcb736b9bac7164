//! JSON file persistence for node identity and service id files

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// Permissions for files holding identity or key material
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Whether a write may replace an existing file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail if the file already exists
    CreateNew,
    /// Replace the file if it exists
    Overwrite,
}

/// Reads and writes JSON files relative to a root directory
#[derive(Clone, Debug)]
pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    /// Handler resolving relative paths against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    /// Whether a file exists
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).exists()
    }

    /// Deserialize a JSON file
    pub fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Result<T> {
        let path = self.resolve(path);
        let raw = fs::read(&path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::serialization(format!("{}: {e}", path.display())))
    }

    /// Serialize `value` as JSON with mode 0600, creating parent directories
    pub fn write_json<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
        mode: WriteMode,
    ) -> Result<()> {
        let raw = serde_json::to_vec_pretty(value)?;
        self.write(path, &raw, mode)
    }

    /// Write raw bytes with mode 0600, creating parent directories
    pub fn write(&self, path: impl AsRef<Path>, contents: &[u8], mode: WriteMode) -> Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut opts = OpenOptions::new();
        opts.write(true).mode(SECRET_FILE_MODE);
        match mode {
            WriteMode::CreateNew => opts.create_new(true),
            WriteMode::Overwrite => opts.create(true).truncate(true),
        };
        let mut file = opts.open(&path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    }
}
