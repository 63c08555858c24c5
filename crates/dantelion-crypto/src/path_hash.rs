//! File path hashes used to key archive lookups
//!
//! Both variants are a simple multiplicative string hash over the UTF-16 code
//! units of the lower-cased path:
//!
//! ```text
//! h = 0
//! for c in path: h = h * M + c     (wrapping)
//! ```
//!
//! Older titles use a 32-bit hash with `M = 37`; newer ones use a 64-bit hash
//! with `M = 0x85`. Callers are expected to normalize the path first (leading
//! `/`, forward slashes), the hash itself only folds case.
//!
//! Case folding is per character: a character whose lower case form is a
//! single character is replaced by it, anything else (`'İ'`, for one) is kept.
//! The hashed code units therefore line up one to one with the input.

/// Lower-case `path` one character at a time, as the path hashes see it
pub fn fold_case(path: &str) -> String {
    path.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    if c.is_ascii() {
        return c.to_ascii_lowercase();
    }
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(single), None) => single,
        _ => c,
    }
}

fn folded_units(path: &str) -> impl Iterator<Item = u16> + '_ {
    path.chars().map(fold_char).flat_map(|c| {
        let mut buf = [0u16; 2];
        let units = c.encode_utf16(&mut buf).len();
        buf.into_iter().take(units)
    })
}

/// A path hash algorithm
pub trait FilePathHash: Send + Sync {
    /// Hash `path`. 32-bit variants zero-extend into the `u64`.
    fn hash_path(&self, path: &str) -> u64;
}

/// 32-bit path hash (multiplier 37)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileHash32;

impl FileHash32 {
    /// Multiplier applied per code unit
    pub const PRIME: u32 = 37;

    /// Hash `path` to a `u32`
    pub fn hash(path: &str) -> u32 {
        folded_units(path).fold(0u32, |h, c| h.wrapping_mul(Self::PRIME).wrapping_add(u32::from(c)))
    }
}

impl FilePathHash for FileHash32 {
    fn hash_path(&self, path: &str) -> u64 {
        u64::from(Self::hash(path))
    }
}

/// 64-bit path hash (multiplier 0x85)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileHash64;

impl FileHash64 {
    /// Multiplier applied per code unit
    pub const PRIME: u64 = 0x85;

    /// Hash `path` to a `u64`
    pub fn hash(path: &str) -> u64 {
        folded_units(path).fold(0u64, |h, c| h.wrapping_mul(Self::PRIME).wrapping_add(u64::from(c)))
    }
}

impl FilePathHash for FileHash64 {
    fn hash_path(&self, path: &str) -> u64 {
        Self::hash(path)
    }
}

/// Which hash an archive family uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathHashKind {
    /// [`FileHash32`]
    Bits32,
    /// [`FileHash64`]
    Bits64,
}

impl PathHashKind {
    /// Hash `path` with the selected algorithm
    pub fn hash(self, path: &str) -> u64 {
        match self {
            Self::Bits32 => FileHash32.hash_path(path),
            Self::Bits64 => FileHash64.hash_path(path),
        }
    }
}

impl FilePathHash for PathHashKind {
    fn hash_path(&self, path: &str) -> u64 {
        self.hash(path)
    }
}
