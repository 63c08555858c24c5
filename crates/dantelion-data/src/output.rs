//! Destination directory for files pulled out of the game data
//!
//! Files are written under their logical path, creating directories as
//! needed. Paths that would land outside the output root are refused.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::Result;
use crate::types::join_relative;

/// Directory extracted files are written to
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    /// Write below `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Output root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location `path` is written to
    pub fn path_for(&self, path: &str) -> Result<PathBuf> {
        join_relative(&self.root, path)
    }

    /// Write `data` to `path`, replacing any existing file.
    ///
    /// Returns the on-disk location.
    pub fn set(&self, path: &str, data: &[u8]) -> Result<PathBuf> {
        let target = self.path_for(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("Saving file to {}", target.display());
        fs::write(&target, data)?;
        Ok(target)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::DataError;
    use tempfile::TempDir;

    #[test]
    fn test_set_creates_directories_and_replaces() {
        let dir = TempDir::new().unwrap();
        let output = OutputDir::new(dir.path().join("out"));

        let written = output.set("/chr/c0000.anibnd.dcx", b"first").unwrap();
        assert_eq!(written, dir.path().join("out").join("chr").join("c0000.anibnd.dcx"));
        assert_eq!(fs::read(&written).unwrap(), b"first");

        output.set("chr\\c0000.anibnd.dcx", b"second").unwrap();
        assert_eq!(fs::read(&written).unwrap(), b"second");
    }

    #[test]
    fn test_set_refuses_to_escape_root() {
        let dir = TempDir::new().unwrap();
        let output = OutputDir::new(dir.path().join("out"));

        assert!(matches!(
            output.set("../escaped.bin", b"x"),
            Err(DataError::InvalidPath(_))
        ));
        assert!(!dir.path().join("escaped.bin").exists());
    }
}
