//! Local store of per-archive RSA header keys
//!
//! The key file is plain text: a `#<archive id>` line followed by the PEM
//! lines of that archive's key, repeated for every archive.
//!
//! ```text
//! #data0
//! -----BEGIN RSA PUBLIC KEY-----
//! MIIBCwKCAQEA...
//! -----END RSA PUBLIC KEY-----
//! #sd/sd
//! ...
//! ```
//!
//! A key block ends at the next `#` line, a blank line, or end of file.
//! Archive ids are lower-cased when read.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::Result;
use crate::types::ArchiveId;

/// PEM keys by archive id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStore {
    keys: BTreeMap<ArchiveId, String>,
}

impl KeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the key file format
    pub fn parse(text: &str) -> Self {
        let mut keys = BTreeMap::new();
        let mut lines = text.lines().peekable();

        while let Some(line) = lines.next() {
            let Some(id) = line.trim_end().strip_prefix('#') else {
                continue;
            };

            let mut pem = String::new();
            while let Some(next) = lines.peek() {
                let next = next.trim_end();
                if next.is_empty() || next.starts_with('#') {
                    break;
                }
                pem.push_str(next);
                pem.push('\n');
                lines.next();
            }
            keys.insert(ArchiveId::new(id.trim()), pem);
        }

        Self { keys }
    }

    /// Load the key file at `path`, or `None` when it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(None);
        }
        let store = Self::parse(&std::fs::read_to_string(path)?);
        debug!("Loaded {} keys from {}", store.len(), path.display());
        Ok(Some(store))
    }

    /// Write the store in the key file format, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_file_string())?;
        debug!("Saved {} keys to {}", self.len(), path.display());
        Ok(())
    }

    /// Render the key file format
    pub fn to_file_string(&self) -> String {
        let mut out = String::new();
        for (id, pem) in &self.keys {
            out.push('#');
            out.push_str(id.as_str());
            out.push('\n');
            for line in pem.lines().filter(|l| !l.trim().is_empty()) {
                out.push_str(line.trim_end());
                out.push('\n');
            }
        }
        out
    }

    /// Key for `id`
    pub fn get(&self, id: &ArchiveId) -> Option<&str> {
        self.keys.get(id).map(String::as_str)
    }

    /// Whether a key for `id` is present
    pub fn contains(&self, id: &ArchiveId) -> bool {
        self.keys.contains_key(id)
    }

    /// Add or replace the key for `id`
    pub fn insert(&mut self, id: ArchiveId, pem: impl Into<String>) {
        self.keys.insert(id, pem.into());
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate keys in archive id order
    pub fn iter(&self) -> impl Iterator<Item = (&ArchiveId, &str)> {
        self.keys.iter().map(|(id, pem)| (id, pem.as_str()))
    }
}
