//! Shared data model: games, archive ids, index entries and path handling

use std::fmt;
use std::path::{Component, Path, PathBuf};

use dantelion_crypto::{PathHashKind, fold_case};
use serde::{Deserialize, Serialize};

use crate::{DCX_EXTENSION, DataError, Result};

/// Supported titles.
///
/// The title decides which path hash the archives use, the name of the
/// per-game data directory and the folder used by the remote key source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Game {
    /// Dark Souls III
    DarkSouls3,
    /// Sekiro: Shadows Die Twice
    Sekiro,
    /// Elden Ring
    EldenRing,
    /// Armored Core VI
    ArmoredCore6,
    /// Elden Ring Nightreign
    Nightreign,
}

impl Game {
    /// Path hash used by this title's archives
    pub const fn hash_kind(self) -> PathHashKind {
        match self {
            Self::DarkSouls3 | Self::Sekiro => PathHashKind::Bits32,
            Self::EldenRing | Self::ArmoredCore6 | Self::Nightreign => PathHashKind::Bits64,
        }
    }

    /// Directory name under the data directory (`<data>/<name>/keys`)
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::DarkSouls3 => "DarkSouls3",
            Self::Sekiro => "Sekiro",
            Self::EldenRing => "EldenRing",
            Self::ArmoredCore6 => "ArmoredCore6",
            Self::Nightreign => "EldenRingNightreign",
        }
    }

    /// Folder name used by the remote key repository
    pub const fn remote_folder(self) -> &'static str {
        match self {
            Self::DarkSouls3 => "DarkSouls3_PC",
            Self::Sekiro => "Sekiro_PC",
            Self::EldenRing => "EldenRing_PC",
            Self::ArmoredCore6 => "ArmoredCore6_PC",
            Self::Nightreign => "EldenRingNightreign_PC",
        }
    }
}

impl fmt::Display for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Normalized archive identifier, e.g. `data0` or `sd/sd`.
///
/// Derived from the header path relative to the game root: everything before
/// the first `.`, lower-cased, with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArchiveId(String);

impl ArchiveId {
    /// Create an id from an already-normalized string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase().replace('\\', "/"))
    }

    /// Derive the id of `header` relative to `root`.
    ///
    /// Returns `None` when `header` is not inside `root`.
    pub fn from_header_path(root: &Path, header: &Path) -> Option<Self> {
        let relative = header.strip_prefix(root).ok()?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let stem = joined.split('.').next().unwrap_or_default();
        if stem.is_empty() {
            return None;
        }
        Some(Self(stem.to_lowercase()))
    }

    /// Id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name stem for this archive's header cache (`sd/sd` → `sd_sd`)
    pub fn cache_name(&self) -> String {
        self.0.replace('/', "_")
    }

    /// Last path segment (`sd/sd` → `sd`)
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArchiveId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One encrypted range inside a stored file, as absolute payload offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesRange {
    /// First encrypted byte
    pub start_offset: i64,
    /// One past the last encrypted byte
    pub end_offset: i64,
}

impl AesRange {
    /// Create a range
    pub const fn new(start_offset: i64, end_offset: i64) -> Self {
        Self {
            start_offset,
            end_offset,
        }
    }

    /// Whether the range encrypts nothing and is skipped silently.
    ///
    /// Either bound set to `-1`, or an empty span.
    pub const fn is_degenerate(&self) -> bool {
        self.start_offset == -1 || self.end_offset == -1 || self.start_offset == self.end_offset
    }
}

/// AES-128 key and the ranges it applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileKey {
    /// AES-128 key
    pub key: [u8; 16],
    /// Encrypted ranges, in payload coordinates
    pub ranges: Vec<AesRange>,
}

impl FileKey {
    /// Create a file key
    pub fn new(key: [u8; 16], ranges: Vec<AesRange>) -> Self {
        Self { key, ranges }
    }
}

/// Index entry for one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path hash of the stored file
    pub file_name_hash: u64,
    /// Offset of the payload inside the data file
    pub file_offset: i64,
    /// Payload size including alignment padding
    pub padded_file_size: i64,
    /// Present when parts of the payload are encrypted
    pub aes_key: Option<FileKey>,
}

impl FileEntry {
    /// Create an unencrypted entry
    pub const fn new(file_name_hash: u64, file_offset: i64, padded_file_size: i64) -> Self {
        Self {
            file_name_hash,
            file_offset,
            padded_file_size,
            aes_key: None,
        }
    }

    /// Attach an AES key
    #[must_use]
    pub fn with_key(mut self, key: FileKey) -> Self {
        self.aes_key = Some(key);
        self
    }
}

/// Extensions of files that are never stored as `.dcx` containers
const NEVER_COMPRESSED: [&str; 17] = [
    "hks", "bdt", "bhd", "bin", "plt", "prx", "dat", "sha", "dds", "png", "sfo", "xml", "sig",
    "info", "sprx", "gfx", "bnk",
];

/// Normalize a logical game path before hashing.
///
/// Trims whitespace, converts `\` to `/`, lower-cases and prefixes `/`. Paths
/// with an extension get `.dcx` appended, unless they already end in `.dcx` or
/// end in one of the never-compressed extensions.
///
/// ```
/// use dantelion_data::normalize_path;
///
/// assert_eq!(normalize_path("Chr\\c0000.anibnd"), "/chr/c0000.anibnd.dcx");
/// assert_eq!(normalize_path("regulation.bin"), "/regulation.bin");
/// ```
pub fn normalize_path(path: &str) -> String {
    let mut normalized = fold_case(&path.trim().replace('\\', "/"));

    let dcx_suffix = format!(".{DCX_EXTENSION}");
    let has_extension = normalized.contains('.');
    if has_extension
        && !normalized.ends_with(&dcx_suffix)
        && !NEVER_COMPRESSED.iter().any(|ext| normalized.ends_with(ext))
    {
        normalized.push_str(&dcx_suffix);
    }

    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    normalized
}

/// Join a logical `/` or `\` separated path onto `base`.
///
/// Empty and `.` segments are dropped. A `..` segment, or anything that is not
/// a plain name (drive prefixes, roots), is rejected so the result always
/// stays below `base`.
pub(crate) fn join_relative(base: &Path, path: &str) -> Result<PathBuf> {
    let mut joined = base.to_path_buf();
    for part in path.trim().split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        let plain = Path::new(part)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(DataError::InvalidPath(path.to_string()));
        }
        joined.push(part);
    }
    Ok(joined)
}
