//! Read surface over a bootstrapped encrypted installation
//!
//! [`EncryptedData`] can only be obtained from a finished bootstrap, so every
//! archive index it holds is complete and immutable. Reads take no locks: the
//! archive map is a plain `BTreeMap` and the readers share their engine pool
//! and counters through `Arc`s.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{Span, debug, info, info_span};

use crate::bootstrap::{Archive, ArchiveBootstrap, ArchiveState, Bootstrapped};
use crate::config::DataConfig;
use crate::index::{ArchiveIndex, IndexParser};
use crate::reader::{EnginePool, ReadDiagnostics};
use crate::types::{ArchiveId, FileEntry, Game, normalize_path};
use crate::{DataError, REGULATION_PATH, Result};

/// How many of a list of paths resolve to stored files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    /// Paths checked
    pub requested: usize,
    /// Paths found in some archive
    pub resolved: usize,
    /// Entries across all archive indexes
    pub indexed: usize,
}

impl Coverage {
    /// Share of indexed entries that the given paths account for, in percent
    pub fn percent_of_index(&self) -> f64 {
        if self.indexed == 0 {
            return 0.0;
        }
        self.resolved as f64 * 100.0 / self.indexed as f64
    }
}

/// Encrypted game data, ready for reads
pub struct EncryptedData {
    game: Game,
    archives: BTreeMap<ArchiveId, Archive>,
    engines: Arc<EnginePool>,
    diagnostics: Arc<ReadDiagnostics>,
    span: Span,
}

impl EncryptedData {
    /// Bootstrap the installation described by `config`
    pub async fn open(config: DataConfig, parser: Arc<dyn IndexParser>) -> Result<Self> {
        let game = config.game;
        let bootstrap = ArchiveBootstrap::new(config, parser);
        let span = bootstrap.span().clone();
        let done = bootstrap.run().await?;
        Ok(Self::from_bootstrapped(game, done, span))
    }

    /// Wrap the result of an [`ArchiveBootstrap`] run
    pub fn from_bootstrapped(game: Game, bootstrapped: Bootstrapped, span: Span) -> Self {
        let archives = bootstrapped
            .archives
            .into_iter()
            .map(|archive| (archive.id().clone(), archive))
            .collect::<BTreeMap<_, _>>();

        let ready = archives.values().filter(|a| a.state().is_ready()).count();
        span.in_scope(|| info!("{} of {} archives ready", ready, archives.len()));

        Self {
            game,
            archives,
            engines: bootstrapped.engines,
            diagnostics: bootstrapped.diagnostics,
            span: info_span!(parent: &span, "reads"),
        }
    }

    /// Title being served
    pub fn game(&self) -> Game {
        self.game
    }

    /// Normalize `path` and hash it with this title's algorithm
    pub fn hash_path(&self, path: &str) -> (String, u64) {
        let normalized = normalize_path(path);
        let hash = self.game.hash_kind().hash(&normalized);
        (normalized, hash)
    }

    /// Archive ids in lookup order
    pub fn archive_ids(&self) -> impl Iterator<Item = &ArchiveId> {
        self.archives.keys()
    }

    /// Bootstrap outcome of every archive
    pub fn archive_states(&self) -> impl Iterator<Item = (&ArchiveId, &ArchiveState)> {
        self.archives.iter().map(|(id, a)| (id, a.state()))
    }

    /// Archive holding `path`, searching archives in id order
    pub fn locate(&self, path: &str) -> Option<&ArchiveId> {
        let (_, hash) = self.hash_path(path);
        self.find(hash).map(|(archive, _)| archive.id())
    }

    /// Whether `path` is stored in any archive
    pub fn exists(&self, path: &str) -> bool {
        self.locate(path).is_some()
    }

    /// Read and decrypt `path` from whichever archive holds it
    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let _enter = self.span.enter();
        let (normalized, hash) = self.hash_path(path);

        let Some((archive, entry)) = self.find(hash) else {
            debug!("{} not found in any archive", normalized);
            return Ok(None);
        };
        info!("Found {} in {}", normalized, archive.id());
        self.read(archive, entry).map(Some)
    }

    /// The parameter regulation file, if any archive stores it
    pub fn regulation(&self) -> Result<Option<Vec<u8>>> {
        self.get(REGULATION_PATH)
    }

    /// Read and decrypt `path` from one archive
    pub fn get_from(&self, archive: &ArchiveId, path: &str) -> Result<Option<Vec<u8>>> {
        let _enter = self.span.enter();
        let archive = self
            .archives
            .get(archive)
            .ok_or_else(|| DataError::ArchiveNotFound(archive.to_string()))?;
        let (normalized, hash) = self.hash_path(path);

        match archive.index().lookup(hash) {
            Some(entry) => {
                info!("Found {} in {}", normalized, archive.id());
                self.read(archive, entry).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Index entries of one archive
    pub fn entries(&self, archive: &ArchiveId) -> Result<Box<dyn Iterator<Item = &FileEntry> + '_>> {
        self.archives
            .get(archive)
            .map(|a| a.index().entries())
            .ok_or_else(|| DataError::ArchiveNotFound(archive.to_string()))
    }

    /// Total number of indexed entries
    pub fn entry_count(&self) -> usize {
        self.archives.values().map(|a| a.index().len()).sum()
    }

    /// Check how many of `paths` resolve to stored files
    pub fn coverage<'a, I>(&self, paths: I) -> Coverage
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut coverage = Coverage {
            indexed: self.entry_count(),
            ..Coverage::default()
        };
        for path in paths {
            coverage.requested += 1;
            if self.exists(path) {
                coverage.resolved += 1;
            }
        }
        self.span.in_scope(|| {
            info!(
                "Coverage: {} of {} paths resolved, {:.2}% of {} entries",
                coverage.resolved,
                coverage.requested,
                coverage.percent_of_index(),
                coverage.indexed
            );
        });
        coverage
    }

    /// Read-path counters
    pub fn diagnostics(&self) -> &ReadDiagnostics {
        &self.diagnostics
    }

    /// Number of distinct AES keys seen so far
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    fn find(&self, hash: u64) -> Option<(&Archive, &FileEntry)> {
        self.archives
            .values()
            .find_map(|archive| archive.index().lookup(hash).map(|entry| (archive, entry)))
    }

    fn read(&self, archive: &Archive, entry: &FileEntry) -> Result<Vec<u8>> {
        let reader = archive
            .reader()
            .ok_or_else(|| DataError::ArchiveNotFound(archive.id().to_string()))?;
        reader.read(entry)
    }
}

impl std::fmt::Debug for EncryptedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedData")
            .field("game", &self.game)
            .field("archives", &self.archives.len())
            .finish_non_exhaustive()
    }
}
