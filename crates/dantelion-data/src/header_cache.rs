//! Persistent cache of decrypted archive headers
//!
//! RSA-decrypting a header takes seconds for the larger archives, so the
//! plaintext is kept on disk next to the MD5 of the encrypted header it came
//! from:
//!
//! ```text
//! <cache_dir>/<cache_name>.bhdcache = [md5(encrypted .bhd) : 16][decrypted header]
//! ```
//!
//! A cache is valid only while the stored digest matches the current header.
//! Validity is decided once in [`HeaderCache::open`] and changes only through a
//! successful [`HeaderCache::overwrite`].

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use dantelion_crypto::{HeaderDecryptor, HeaderDigest};
use memmap2::{Mmap, MmapOptions};
use tracing::{debug, info, warn};

use crate::{CACHE_EXTENSION, Result};

/// Decrypted header cache for one archive
pub struct HeaderCache {
    header_path: PathBuf,
    cache_dir: PathBuf,
    cache_name: String,
    cache_path: PathBuf,
    /// Digest of the encrypted header as it is on disk now
    original_digest: HeaderDigest,
    /// Digest read from the existing cache file, if any
    stored_digest: Option<HeaderDigest>,
    /// Mapped cache file, kept only while valid
    cache: Option<Mmap>,
}

impl HeaderCache {
    /// Open the cache for `header_path` and validate it.
    ///
    /// A missing or truncated cache file is not an error; the cache is simply
    /// invalid until [`overwrite`](Self::overwrite) is called.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        header_path: P,
        cache_dir: Q,
        cache_name: &str,
    ) -> Result<Self> {
        let header_path = header_path.as_ref().to_path_buf();
        let cache_dir = cache_dir.as_ref().to_path_buf();
        let cache_path = cache_dir.join(format!("{cache_name}.{CACHE_EXTENSION}"));

        let original_digest = HeaderDigest::from_data(&map_file(&header_path)?);

        let (stored_digest, cache) = if cache_path.is_file() {
            let mapped = map_file(&cache_path)?;
            let stored = HeaderDigest::from_prefix(&mapped);
            if stored == Some(original_digest) {
                (stored, mapped.into_mmap())
            } else {
                (stored, None)
            }
        } else {
            (None, None)
        };

        debug!(
            "Opened header cache {} (header md5 {}, stored {:?})",
            cache_path.display(),
            original_digest,
            stored_digest.map(|d| d.to_hex())
        );

        Ok(Self {
            header_path,
            cache_dir,
            cache_name: cache_name.to_string(),
            cache_path,
            original_digest,
            stored_digest,
            cache,
        })
    }

    /// Whether the cache matches the current encrypted header
    pub fn is_valid(&self) -> bool {
        self.cache.is_some()
    }

    /// Path of the cache file
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Path of the encrypted header
    pub fn header_path(&self) -> &Path {
        &self.header_path
    }

    /// MD5 of the encrypted header
    pub fn original_digest(&self) -> &HeaderDigest {
        &self.original_digest
    }

    /// Digest stored in the cache file when it was opened or last written
    pub fn stored_digest(&self) -> Option<&HeaderDigest> {
        self.stored_digest.as_ref()
    }

    /// Decrypted header bytes, available only while the cache is valid
    pub fn decrypted(&self) -> Option<&[u8]> {
        self.cache.as_deref().map(|bytes| &bytes[HeaderDigest::LEN..])
    }

    /// Rebuild the cache if it is invalid.
    ///
    /// Decrypts the header with `decryptor`, disposes of any stale cache file
    /// (renamed to `<name>_<HEX8>.bhdcache` when `keep_old` is set, deleted
    /// otherwise) and writes the new cache through a temporary file so that a
    /// partially written cache is never picked up.
    pub fn overwrite(&mut self, decryptor: &dyn HeaderDecryptor, keep_old: bool) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }

        info!("Decrypting header {}", self.header_path.display());
        let encrypted = map_file(&self.header_path)?;
        let digest = HeaderDigest::from_data(&encrypted);
        if digest != self.original_digest {
            warn!(
                "Header {} changed since the cache was opened ({} -> {})",
                self.header_path.display(),
                self.original_digest,
                digest
            );
            self.original_digest = digest;
        }
        let decrypted = decryptor.decrypt_header(&encrypted)?;
        drop(encrypted);

        fs::create_dir_all(&self.cache_dir)?;
        self.dispose_stale(keep_old)?;

        let tmp_path = self
            .cache_dir
            .join(format!(".{}.{CACHE_EXTENSION}.tmp", self.cache_name));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(self.original_digest.as_bytes())?;
            file.write_all(&decrypted)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.cache_path)?;
        info!("Saved header cache to {}", self.cache_path.display());

        let mapped = map_file(&self.cache_path)?;
        self.stored_digest = HeaderDigest::from_prefix(&mapped);
        self.cache = mapped.into_mmap();
        Ok(())
    }

    fn dispose_stale(&self, keep_old: bool) -> Result<()> {
        if !self.cache_path.exists() {
            return Ok(());
        }

        if !keep_old {
            warn!("Deleting stale header cache {}", self.cache_path.display());
            fs::remove_file(&self.cache_path)?;
            return Ok(());
        }

        // A cache too short to hold a digest is archived under the digest of
        // its own bytes
        let suffix = match self.stored_digest {
            Some(old) => old.short_hex_upper(),
            None => HeaderDigest::from_data(&fs::read(&self.cache_path)?).short_hex_upper(),
        };
        let archived = self.archive_path(&suffix);
        warn!(
            "Archiving stale header cache {} as {}",
            self.cache_path.display(),
            archived.display()
        );
        fs::rename(&self.cache_path, archived)?;
        Ok(())
    }

    /// First unused `<name>_<suffix>[_<n>].bhdcache`
    fn archive_path(&self, suffix: &str) -> PathBuf {
        let base = format!("{}_{suffix}", self.cache_name);
        let mut candidate = self.cache_dir.join(format!("{base}.{CACHE_EXTENSION}"));
        let mut n = 1u32;
        while candidate.exists() {
            candidate = self.cache_dir.join(format!("{base}_{n}.{CACHE_EXTENSION}"));
            n += 1;
        }
        candidate
    }
}

impl std::fmt::Debug for HeaderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderCache")
            .field("cache_path", &self.cache_path)
            .field("original_digest", &self.original_digest)
            .field("stored_digest", &self.stored_digest)
            .field("is_valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

/// Read-only view of a file. Empty files cannot be mapped and are held as an
/// empty slice instead.
pub(crate) enum Mapped {
    Map(Mmap),
    Empty,
}

impl Mapped {
    fn into_mmap(self) -> Option<Mmap> {
        match self {
            Self::Map(map) => Some(map),
            Self::Empty => None,
        }
    }
}

impl std::ops::Deref for Mapped {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Map(map) => map,
            Self::Empty => &[],
        }
    }
}

pub(crate) fn map_file(path: &Path) -> Result<Mapped> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Mapped::Empty);
    }
    #[allow(unsafe_code)]
    let map = unsafe { MmapOptions::new().map(&file)? };
    Ok(Mapped::Map(map))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use dantelion_crypto::CryptoError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Reverses the header and counts how often it was asked to
    #[derive(Default)]
    struct ReversingDecryptor {
        calls: AtomicUsize,
    }

    impl HeaderDecryptor for ReversingDecryptor {
        fn decrypt_header(&self, encrypted: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(encrypted.iter().rev().copied().collect())
        }
    }

    fn setup(header: &[u8]) -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let header_path = dir.path().join("data0.bhd");
        fs::write(&header_path, header).unwrap();
        let cache_dir = dir.path().join("cache");
        (dir, header_path, cache_dir)
    }

    #[test]
    fn test_missing_cache_is_invalid() {
        let (_dir, header, cache_dir) = setup(b"encrypted");
        let cache = HeaderCache::open(&header, &cache_dir, "data0").unwrap();
        assert!(!cache.is_valid());
        assert!(cache.decrypted().is_none());
        assert!(cache.stored_digest().is_none());
    }

    #[test]
    fn test_overwrite_then_reopen_is_valid_without_decrypting() {
        let (_dir, header, cache_dir) = setup(b"abc123");
        let decryptor = ReversingDecryptor::default();

        let mut cache = HeaderCache::open(&header, &cache_dir, "data0").unwrap();
        cache.overwrite(&decryptor, false).unwrap();
        assert!(cache.is_valid());
        assert_eq!(cache.decrypted().unwrap(), b"321cba");

        let on_disk = fs::read(cache_dir.join("data0.bhdcache")).unwrap();
        assert_eq!(&on_disk[..16], HeaderDigest::from_data(b"abc123").as_bytes());
        assert_eq!(&on_disk[16..], b"321cba");

        let mut reopened = HeaderCache::open(&header, &cache_dir, "data0").unwrap();
        assert!(reopened.is_valid());
        assert_eq!(reopened.decrypted().unwrap(), b"321cba");
        reopened.overwrite(&decryptor, false).unwrap();
        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_changed_header_invalidates_and_deletes() {
        let (_dir, header, cache_dir) = setup(b"first");
        let decryptor = ReversingDecryptor::default();
        HeaderCache::open(&header, &cache_dir, "data0")
            .unwrap()
            .overwrite(&decryptor, false)
            .unwrap();

        fs::write(&header, b"second").unwrap();
        let mut cache = HeaderCache::open(&header, &cache_dir, "data0").unwrap();
        assert!(!cache.is_valid());
        assert_eq!(
            cache.stored_digest(),
            Some(&HeaderDigest::from_data(b"first"))
        );

        cache.overwrite(&decryptor, false).unwrap();
        assert_eq!(cache.decrypted().unwrap(), b"dnoces");

        let names: Vec<_> = fs::read_dir(&cache_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["data0.bhdcache".to_string()]);
    }

    #[test]
    fn test_keep_old_archives_with_digest_suffix() {
        let (_dir, header, cache_dir) = setup(b"first");
        let decryptor = ReversingDecryptor::default();
        HeaderCache::open(&header, &cache_dir, "sd_sd")
            .unwrap()
            .overwrite(&decryptor, true)
            .unwrap();

        fs::write(&header, b"second").unwrap();
        let mut cache = HeaderCache::open(&header, &cache_dir, "sd_sd").unwrap();
        cache.overwrite(&decryptor, true).unwrap();

        let suffix = HeaderDigest::from_data(b"first").short_hex_upper();
        let archived = cache_dir.join(format!("sd_sd_{suffix}.bhdcache"));
        let old = fs::read(archived).unwrap();
        assert_eq!(&old[16..], b"tsrif");
        assert!(cache.is_valid());
    }

    #[test]
    fn test_single_flipped_byte_invalidates() {
        let (_dir, header, cache_dir) = setup(&[7u8; 64]);
        let decryptor = ReversingDecryptor::default();
        HeaderCache::open(&header, &cache_dir, "data0")
            .unwrap()
            .overwrite(&decryptor, false)
            .unwrap();

        let mut bytes = fs::read(&header).unwrap();
        bytes[40] ^= 0x01;
        fs::write(&header, bytes).unwrap();

        assert!(!HeaderCache::open(&header, &cache_dir, "data0").unwrap().is_valid());
    }

    #[test]
    fn test_truncated_cache_is_invalid() {
        let (_dir, header, cache_dir) = setup(b"header");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join("data0.bhdcache"), [1u8; 8]).unwrap();

        let mut cache = HeaderCache::open(&header, &cache_dir, "data0").unwrap();
        assert!(!cache.is_valid());
        assert!(cache.stored_digest().is_none());

        cache.overwrite(&ReversingDecryptor::default(), true).unwrap();
        assert!(cache.is_valid());

        // Kept under the digest of the truncated bytes themselves
        let suffix = HeaderDigest::from_data(&[1u8; 8]).short_hex_upper();
        let archived = cache_dir.join(format!("data0_{suffix}.bhdcache"));
        assert_eq!(fs::read(archived).unwrap(), vec![1u8; 8]);
    }

    #[test]
    fn test_keep_old_never_replaces_an_archived_cache() {
        let (_dir, header, cache_dir) = setup(b"first");
        let decryptor = ReversingDecryptor::default();
        HeaderCache::open(&header, &cache_dir, "data0")
            .unwrap()
            .overwrite(&decryptor, true)
            .unwrap();

        let suffix = HeaderDigest::from_data(b"first").short_hex_upper();
        let taken = cache_dir.join(format!("data0_{suffix}.bhdcache"));
        fs::write(&taken, b"older archive").unwrap();

        fs::write(&header, b"second").unwrap();
        HeaderCache::open(&header, &cache_dir, "data0")
            .unwrap()
            .overwrite(&decryptor, true)
            .unwrap();

        assert_eq!(fs::read(&taken).unwrap(), b"older archive");
        let next = cache_dir.join(format!("data0_{suffix}_1.bhdcache"));
        assert_eq!(&fs::read(next).unwrap()[16..], b"tsrif");
    }

    #[test]
    fn test_digest_follows_the_bytes_actually_decrypted() {
        let (_dir, header, cache_dir) = setup(b"before");
        let mut cache = HeaderCache::open(&header, &cache_dir, "data0").unwrap();

        // The header is replaced between open and overwrite
        fs::write(&header, b"after").unwrap();
        cache.overwrite(&ReversingDecryptor::default(), false).unwrap();

        assert_eq!(cache.original_digest(), &HeaderDigest::from_data(b"after"));
        assert_eq!(cache.decrypted().unwrap(), b"retfa");

        let reopened = HeaderCache::open(&header, &cache_dir, "data0").unwrap();
        assert!(reopened.is_valid());
        assert_eq!(reopened.decrypted().unwrap(), b"retfa");
    }
}
