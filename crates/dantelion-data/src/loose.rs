//! Read surface over an already unpacked game directory
//!
//! Unpacked installations store files under their logical paths. Compressed
//! files keep a `.dcx` suffix, so a lookup that misses falls back to the same
//! path with `.dcx` appended.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::pattern::PathPattern;
use crate::types::join_relative;
use crate::{DCX_EXTENSION, REGULATION_PATH, Result};

/// Files served straight from a directory tree
#[derive(Debug, Clone)]
pub struct LooseData {
    root: PathBuf,
}

impl LooseData {
    /// Serve files below `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        info!("Using loose data at {}", root.as_ref().display());
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location for `path`, preferring the uncompressed file.
    ///
    /// Paths that climb out of the root are rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let full = join_relative(&self.root, path)?;

        let dcx_suffix = format!(".{DCX_EXTENSION}");
        if full.is_file() || full.to_string_lossy().ends_with(&dcx_suffix) {
            return Ok(full);
        }
        let mut compressed = full.into_os_string();
        compressed.push(&dcx_suffix);
        Ok(PathBuf::from(compressed))
    }

    /// Whether `path` (or its `.dcx` variant) exists
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|resolved| resolved.is_file())
    }

    /// Read `path`, or `None` when neither it nor its `.dcx` variant exists
    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            debug!("{} not found under {}", path, self.root.display());
            return Ok(None);
        }
        info!("Loading file {}", resolved.display());
        Ok(Some(std::fs::read(resolved)?))
    }

    /// The parameter regulation file, if the installation has one
    pub fn regulation(&self) -> Result<Option<Vec<u8>>> {
        self.get(REGULATION_PATH)
    }

    /// Every file below `dir`, as `/`-separated paths relative to the root
    pub fn files(&self, dir: &str) -> Result<Vec<String>> {
        self.collect_files(dir, |_| true)
    }

    /// Files below `dir` whose file name matches `pattern` (`*` and `?`
    /// wildcards)
    pub fn files_matching(&self, dir: &str, pattern: &str) -> Result<Vec<String>> {
        let pattern = PathPattern::new(pattern)?;
        info!("Searching {} for files matching {}", dir, pattern);
        self.collect_files(dir, |name| pattern.is_match(name))
    }

    fn collect_files<F>(&self, dir: &str, mut keep: F) -> Result<Vec<String>>
    where
        F: FnMut(&str) -> bool,
    {
        let start = join_relative(&self.root, dir)?;
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(&start) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() || !keep(&entry.file_name().to_string_lossy()) {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                let logical = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                found.push(format!("/{logical}"));
            }
        }
        found.sort();
        debug!("Found {} files under {}", found.len(), start.display());
        Ok(found)
    }
}
