//! Archive index interface
//!
//! The binary layout of a decrypted header (buckets of file entries) is read
//! by an external parser. This module defines the two seams the rest of the
//! crate depends on:
//!
//! - [`IndexParser`] turns decrypted header bytes into an index
//! - [`ArchiveIndex`] answers lookups by path hash
//!
//! [`FileTable`] is the frozen implementation parsers are expected to produce:
//! entries are collected with a [`FileTableBuilder`], sorted once by hash and
//! never modified again, so lookups need no locking.

use crate::Result;
use crate::types::{FileEntry, Game};

/// Read-only lookup of stored files by path hash
pub trait ArchiveIndex: Send + Sync {
    /// Find the entry for `hash`
    fn lookup(&self, hash: u64) -> Option<&FileEntry>;

    /// All entries in the index
    fn entries(&self) -> Box<dyn Iterator<Item = &FileEntry> + '_>;

    /// Number of entries
    fn len(&self) -> usize;

    /// Whether the index has no entries
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses a decrypted header into an [`ArchiveIndex`]
pub trait IndexParser: Send + Sync {
    /// Parse `header`, the plaintext of one `.bhd` file for `game`
    fn parse(&self, header: &[u8], game: Game) -> Result<Box<dyn ArchiveIndex>>;
}

/// Frozen index sorted by path hash
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    entries: Vec<FileEntry>,
}

impl FileTable {
    /// Index with no entries, used for archives without a key
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start collecting entries
    pub fn builder() -> FileTableBuilder {
        FileTableBuilder::default()
    }

    /// Entries as a slice, ordered by hash
    pub fn as_slice(&self) -> &[FileEntry] {
        &self.entries
    }
}

impl ArchiveIndex for FileTable {
    fn lookup(&self, hash: u64) -> Option<&FileEntry> {
        self.entries
            .binary_search_by_key(&hash, |e| e.file_name_hash)
            .ok()
            .map(|i| &self.entries[i])
    }

    fn entries(&self) -> Box<dyn Iterator<Item = &FileEntry> + '_> {
        Box::new(self.entries.iter())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Collects entries for a [`FileTable`]
#[derive(Debug, Default)]
pub struct FileTableBuilder {
    entries: Vec<FileEntry>,
}

impl FileTableBuilder {
    /// Builder with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Add an entry
    pub fn push(&mut self, entry: FileEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    /// Number of entries collected so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been collected
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the collected entries.
    ///
    /// When the same hash appears more than once the first entry pushed wins.
    pub fn build(mut self) -> FileTable {
        self.entries.sort_by_key(|e| e.file_name_hash);
        self.entries.dedup_by_key(|e| e.file_name_hash);
        self.entries.shrink_to_fit();
        FileTable {
            entries: self.entries,
        }
    }
}

impl Extend<FileEntry> for FileTableBuilder {
    fn extend<T: IntoIterator<Item = FileEntry>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

impl FromIterator<FileEntry> for FileTable {
    fn from_iter<T: IntoIterator<Item = FileEntry>>(iter: T) -> Self {
        let mut builder = FileTableBuilder::default();
        builder.extend(iter);
        builder.build()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_after_build() {
        let mut builder = FileTable::builder();
        builder
            .push(FileEntry::new(30, 0, 16))
            .push(FileEntry::new(10, 16, 32))
            .push(FileEntry::new(20, 48, 16));
        let table = builder.build();

        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup(10).unwrap().file_offset, 16);
        assert_eq!(table.lookup(30).unwrap().file_offset, 0);
        assert!(table.lookup(40).is_none());

        let hashes: Vec<u64> = table.entries().map(|e| e.file_name_hash).collect();
        assert_eq!(hashes, vec![10, 20, 30]);
    }

    #[test]
    fn test_first_duplicate_wins() {
        let table: FileTable = [FileEntry::new(5, 100, 16), FileEntry::new(5, 200, 16)]
            .into_iter()
            .collect();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(5).unwrap().file_offset, 100);
    }

    #[test]
    fn test_empty_table() {
        let table = FileTable::empty();
        assert!(table.is_empty());
        assert!(table.lookup(0).is_none());
    }
}
