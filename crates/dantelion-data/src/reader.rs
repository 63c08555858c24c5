//! Selective-decrypt reads from archive data files
//!
//! A stored file is a contiguous span of the `.bdt` data file. When its index
//! entry carries an AES key, only the listed ranges of the payload are
//! encrypted (AES-128 ECB); everything else is already plaintext.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dantelion_crypto::{AesEngine, BLOCK_SIZE};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::header_cache::{Mapped, map_file};
use crate::types::{AesRange, FileEntry};
use crate::{DataError, Result};

/// AES engines shared across reads, keyed by raw key bytes.
///
/// Engines are immutable after key expansion, so one instance per distinct key
/// serves every concurrent reader.
#[derive(Debug, Default)]
pub struct EnginePool {
    engines: DashMap<[u8; 16], Arc<AesEngine>>,
}

impl EnginePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for `key`, expanded on first use
    pub fn get(&self, key: &[u8; 16]) -> Result<Arc<AesEngine>> {
        if let Some(engine) = self.engines.get(key) {
            return Ok(Arc::clone(engine.value()));
        }
        let engine = Arc::new(AesEngine::new(key)?);
        Ok(Arc::clone(self.engines.entry(*key).or_insert(engine).value()))
    }

    /// Number of distinct keys expanded so far
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether no engine has been created yet
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// Counters describing read-path anomalies
#[derive(Debug, Default)]
pub struct ReadDiagnostics {
    reads: AtomicU64,
    decrypted_ranges: AtomicU64,
    malformed_ranges: AtomicU64,
}

impl ReadDiagnostics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Files read
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Ranges decrypted
    pub fn decrypted_ranges(&self) -> u64 {
        self.decrypted_ranges.load(Ordering::Relaxed)
    }

    /// Ranges skipped because their bounds made no sense
    pub fn malformed_ranges(&self) -> u64 {
        self.malformed_ranges.load(Ordering::Relaxed)
    }
}

/// Reader over one memory-mapped `.bdt` data file
pub struct SelectiveDecryptor {
    path: PathBuf,
    data: Mapped,
    engines: Arc<EnginePool>,
    diagnostics: Arc<ReadDiagnostics>,
}

impl SelectiveDecryptor {
    /// Map the data file at `path` read-only
    pub fn open<P: AsRef<Path>>(
        path: P,
        engines: Arc<EnginePool>,
        diagnostics: Arc<ReadDiagnostics>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = map_file(&path)?;
        debug!("Mapped data file {} ({} bytes)", path.display(), data.len());
        Ok(Self {
            path,
            data,
            engines,
            diagnostics,
        })
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the data file in bytes
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the data file is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shared read counters
    pub fn diagnostics(&self) -> &ReadDiagnostics {
        &self.diagnostics
    }

    /// Borrow the raw (still encrypted) bytes of `entry`
    pub fn read_raw(&self, entry: &FileEntry) -> Result<&[u8]> {
        let out_of_bounds = || DataError::OutOfBounds {
            offset: entry.file_offset,
            size: entry.padded_file_size,
            len: self.len(),
        };

        let start = usize::try_from(entry.file_offset).map_err(|_| out_of_bounds())?;
        let size = usize::try_from(entry.padded_file_size).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(size).ok_or_else(out_of_bounds)?;
        self.data.get(start..end).ok_or_else(out_of_bounds)
    }

    /// Read `entry` and decrypt its encrypted ranges
    pub fn read(&self, entry: &FileEntry) -> Result<Vec<u8>> {
        let mut bytes = self.read_raw(entry)?.to_vec();
        self.diagnostics.reads.fetch_add(1, Ordering::Relaxed);

        if let Some(key) = &entry.aes_key {
            let engine = self.engines.get(&key.key)?;
            let applied = decrypt_ranges(&engine, &mut bytes, &key.ranges, &self.diagnostics)?;
            debug!(
                "Read {:016x}: {} bytes, {} of {} ranges decrypted",
                entry.file_name_hash,
                bytes.len(),
                applied,
                key.ranges.len()
            );
        }

        Ok(bytes)
    }
}

impl std::fmt::Debug for SelectiveDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectiveDecryptor")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// ECB-decrypt every usable range of `payload` in place.
///
/// Degenerate ranges are skipped silently. Malformed ranges (negative or
/// inverted bounds, past the end of the payload, not a whole number of
/// blocks) are skipped, counted and logged. Returns the number of ranges
/// decrypted.
pub fn decrypt_ranges(
    engine: &AesEngine,
    payload: &mut [u8],
    ranges: &[AesRange],
    diagnostics: &ReadDiagnostics,
) -> Result<usize> {
    let mut applied = 0;
    for range in ranges {
        if range.is_degenerate() {
            continue;
        }

        let Some((start, end)) = usable_bounds(range, payload.len()) else {
            diagnostics.malformed_ranges.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Skipping malformed AES range {}..{} in a {} byte payload",
                range.start_offset,
                range.end_offset,
                payload.len()
            );
            continue;
        };

        engine.ecb_decrypt_in_place(&mut payload[start..end])?;
        applied += 1;
    }

    diagnostics
        .decrypted_ranges
        .fetch_add(applied as u64, Ordering::Relaxed);
    Ok(applied)
}

fn usable_bounds(range: &AesRange, len: usize) -> Option<(usize, usize)> {
    let start = usize::try_from(range.start_offset).ok()?;
    let end = usize::try_from(range.end_offset).ok()?;
    if start > end || end > len || (end - start) % BLOCK_SIZE != 0 {
        return None;
    }
    Some((start, end))
}
