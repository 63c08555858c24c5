//! Startup of an encrypted installation
//!
//! Every archive goes through the same pipeline:
//!
//! ```text
//! Discovered ─┬─ KeyResolved ─┬─ cache valid ───┬─ IndexParsed ─ Ready
//!             │               └─ cache rebuilt ─┘
//!             └─ KeyMissing ───────────────────────────────────── Ready (empty index)
//! ```
//!
//! Keyed archives run on blocking workers, at most
//! [`DataConfig::max_workers`] at a time, and [`ArchiveBootstrap::run`] only
//! returns once all of them have finished. A failing worker leaves its archive
//! with an empty index; the other archives are unaffected.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dantelion_crypto::{AesEngine, CryptoError, RsaHeaderKey};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::DataConfig;
use crate::header_cache::HeaderCache;
use crate::index::{ArchiveIndex, FileTable, IndexParser};
use crate::keys::KeyStore;
use crate::reader::{EnginePool, ReadDiagnostics, SelectiveDecryptor};
use crate::remote::RemoteKeySource;
use crate::types::{ArchiveId, Game};
use crate::{DATA_EXTENSION, DataError, HEADER_EXTENSION, Result};

/// Outcome of bootstrapping one archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveState {
    /// Index parsed and data file mapped
    Ready {
        /// Number of entries in the index
        entries: usize,
        /// Whether the header had to be RSA-decrypted this run
        cache_rebuilt: bool,
    },
    /// No key was available; the archive is served with an empty index
    KeyMissing,
    /// The worker failed; the archive is served with an empty index
    Failed(String),
}

impl ArchiveState {
    /// Whether the archive can serve reads
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// A bootstrapped archive, frozen for the lifetime of the read surface
pub struct Archive {
    id: ArchiveId,
    header_path: PathBuf,
    state: ArchiveState,
    index: Box<dyn ArchiveIndex>,
    reader: Option<SelectiveDecryptor>,
}

impl Archive {
    fn unavailable(job: ArchiveJob, state: ArchiveState) -> Self {
        Self {
            id: job.id,
            header_path: job.header_path,
            state,
            index: Box::new(FileTable::empty()),
            reader: None,
        }
    }

    /// Archive id
    pub fn id(&self) -> &ArchiveId {
        &self.id
    }

    /// Path of the encrypted header
    pub fn header_path(&self) -> &Path {
        &self.header_path
    }

    /// Bootstrap outcome
    pub fn state(&self) -> &ArchiveState {
        &self.state
    }

    /// File index, empty unless the archive is ready
    pub fn index(&self) -> &dyn ArchiveIndex {
        self.index.as_ref()
    }

    /// Data file reader, present only when the archive is ready
    pub fn reader(&self) -> Option<&SelectiveDecryptor> {
        self.reader.as_ref()
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("entries", &self.index.len())
            .finish_non_exhaustive()
    }
}

/// One discovered header waiting to be bootstrapped
#[derive(Debug, Clone)]
struct ArchiveJob {
    id: ArchiveId,
    header_path: PathBuf,
}

/// Archives plus the read-path state they share
pub struct Bootstrapped {
    /// Archives in archive id order
    pub archives: Vec<Archive>,
    /// Engine pool used by every reader
    pub engines: Arc<EnginePool>,
    /// Counters shared by every reader
    pub diagnostics: Arc<ReadDiagnostics>,
}

/// Drives discovery, key resolution and the per-archive workers
pub struct ArchiveBootstrap {
    config: DataConfig,
    parser: Arc<dyn IndexParser>,
    keys: Option<KeyStore>,
    span: Span,
}

impl ArchiveBootstrap {
    /// Create a bootstrap for `config`, parsing headers with `parser`
    pub fn new(config: DataConfig, parser: Arc<dyn IndexParser>) -> Self {
        let span = info_span!("bootstrap", game = %config.game);
        Self {
            config,
            parser,
            keys: None,
            span,
        }
    }

    /// Use `keys` instead of the key store file and remote source
    #[must_use]
    pub fn with_keys(mut self, keys: KeyStore) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Emit events inside `span` instead of the default `bootstrap` span
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Span events are emitted in
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Configuration in use
    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    /// Bootstrap every archive and wait for all workers
    pub async fn run(self) -> Result<Bootstrapped> {
        let span = self.span.clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<Bootstrapped> {
        let started = Instant::now();
        ensure_cipher_support(AesEngine::is_supported())?;
        let root = &self.config.game_root;

        let jobs = discover_archives(root)?;
        info!("Found {} archives in {}", jobs.len(), root.display());

        let keys = match self.keys {
            Some(keys) => keys,
            None => resolve_keys(&self.config, &jobs).await?,
        };

        let cache_dir = self.config.cache_dir();
        std::fs::create_dir_all(&cache_dir)?;

        let engines = Arc::new(EnginePool::new());
        let diagnostics = Arc::new(ReadDiagnostics::new());
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let parent = Span::current();

        let workers = jobs.into_iter().map(|job| {
            let pem = keys.get(&job.id).map(str::to_owned);
            let worker = Worker {
                parser: Arc::clone(&self.parser),
                cache_dir: cache_dir.clone(),
                keep_old: self.config.keep_old_cache,
                game: self.config.game,
                engines: Arc::clone(&engines),
                diagnostics: Arc::clone(&diagnostics),
            };
            let semaphore = Arc::clone(&semaphore);
            let span = info_span!(parent: &parent, "archive", id = %job.id);

            async move {
                let Some(pem) = pem else {
                    warn!("The header key for {} was not found", job.id);
                    return Archive::unavailable(job, ArchiveState::KeyMissing);
                };

                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Worker pool closed: {}", e);
                        return Archive::unavailable(job, ArchiveState::Failed(e.to_string()));
                    }
                };

                info!("Starting worker for {}", job.id);
                let worker_job = job.clone();
                let worker_span = Span::current();
                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    worker_span.in_scope(|| worker.run(worker_job, &pem))
                });

                match handle.await {
                    Ok(Ok(archive)) => archive,
                    Ok(Err(e)) => {
                        error!("Failed to bootstrap {}: {}", job.id, e);
                        Archive::unavailable(job, ArchiveState::Failed(e.to_string()))
                    }
                    Err(e) => {
                        let e = DataError::Worker(e.to_string());
                        error!("Worker for {} did not finish: {}", job.id, e);
                        Archive::unavailable(job, ArchiveState::Failed(e.to_string()))
                    }
                }
            }
            .instrument(span)
        });

        let archives = join_all(workers).await;
        info!(
            "All workers finished in {}ms",
            started.elapsed().as_millis()
        );

        Ok(Bootstrapped {
            archives,
            engines,
            diagnostics,
        })
    }
}

/// Everything a blocking worker needs, detached from the bootstrap
struct Worker {
    parser: Arc<dyn IndexParser>,
    cache_dir: PathBuf,
    keep_old: bool,
    game: Game,
    engines: Arc<EnginePool>,
    diagnostics: Arc<ReadDiagnostics>,
}

impl Worker {
    fn run(self, job: ArchiveJob, pem: &str) -> Result<Archive> {
        let mut cache = HeaderCache::open(&job.header_path, &self.cache_dir, &job.id.cache_name())?;

        let cache_rebuilt = if cache.is_valid() {
            info!(
                "Cache MD5 ({}...) matches for {}",
                cache.original_digest().short_hex_upper(),
                job.id
            );
            false
        } else {
            warn!("Header cache for {} is stale or missing", job.id);
            let key = RsaHeaderKey::from_pem(pem)?;
            cache.overwrite(&key, self.keep_old)?;
            true
        };

        let header = cache
            .decrypted()
            .ok_or_else(|| DataError::Index(format!("no decrypted header for {}", job.id)))?;
        let index = self.parser.parse(header, self.game)?;
        drop(cache);

        let data_path = job.header_path.with_extension(DATA_EXTENSION);
        let reader = SelectiveDecryptor::open(&data_path, self.engines, self.diagnostics)?;

        let entries = index.len();
        info!("Indexed {} entries for {}", entries, job.id);
        Ok(Archive {
            id: job.id,
            header_path: job.header_path,
            state: ArchiveState::Ready {
                entries,
                cache_rebuilt,
            },
            index,
            reader: Some(reader),
        })
    }
}

/// Find `data*.bhd` and `dlc*.bhd` in `root` and `sd*.bhd` in `root/sd`.
///
/// Returns jobs sorted by archive id. An installation with no headers at all
/// is an error.
fn discover_archives(root: &Path) -> Result<Vec<ArchiveJob>> {
    let mut headers = matching_headers(root, &["data", "dlc"])?;
    let sd = root.join("sd");
    if sd.is_dir() {
        headers.extend(matching_headers(&sd, &["sd"])?);
    }

    let mut jobs: Vec<ArchiveJob> = headers
        .into_iter()
        .filter_map(|header_path| {
            let id = ArchiveId::from_header_path(root, &header_path)?;
            debug!("Discovered {} at {}", id, header_path.display());
            Some(ArchiveJob { id, header_path })
        })
        .collect();

    if jobs.is_empty() {
        return Err(DataError::NoArchives(root.to_path_buf()));
    }
    jobs.sort_by(|a, b| a.id.cmp(&b.id));
    jobs.dedup_by(|a, b| a.id == b.id);
    Ok(jobs)
}

fn matching_headers(dir: &Path, prefixes: &[&str]) -> Result<Vec<PathBuf>> {
    let suffix = format!(".{HEADER_EXTENSION}");
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.ends_with(&suffix) && prefixes.iter().any(|p| name.starts_with(p)) {
            found.push(entry.path());
        }
    }
    Ok(found)
}

/// Load the key store and fetch the keys it lacks from the remote source.
///
/// Keys that arrive remotely are merged into the store and saved back.
async fn resolve_keys(config: &DataConfig, jobs: &[ArchiveJob]) -> Result<KeyStore> {
    let keys_path = config.keys_path();
    let mut store = KeyStore::load(&keys_path)?.unwrap_or_else(|| {
        warn!("No key store found at {}", keys_path.display());
        KeyStore::new()
    });

    let missing: Vec<&ArchiveJob> = jobs.iter().filter(|job| !store.contains(&job.id)).collect();
    if missing.is_empty() {
        return Ok(store);
    }

    let Some(remote) = &config.remote else {
        warn!(
            "Remote key source disabled; {} archives have no key",
            missing.len()
        );
        return Ok(store);
    };

    info!(
        "Fetching {} missing header keys from {}",
        missing.len(),
        remote.base_url
    );
    let source = RemoteKeySource::new(remote, config.game)?;
    let fetches = missing.iter().map(|job| {
        let source = &source;
        async move { (job.id.clone(), source.fetch_key(&job.id).await) }
    });

    let mut fetched = 0usize;
    for (id, result) in join_all(fetches).await {
        match result {
            Ok(Some(pem)) => {
                store.insert(id, pem);
                fetched += 1;
            }
            Ok(None) => debug!("The remote key source has no key for {}", id),
            Err(e) => warn!("Fetching key for {} failed: {}", id, e),
        }
    }

    if fetched == 0 {
        warn!("The remote key source returned no keys");
    } else {
        store.save(&keys_path)?;
        info!("Saved {} remote keys to {}", fetched, keys_path.display());
    }
    Ok(store)
}

/// Selective decryption needs AES-NI; without it the installation cannot be
/// served at all
pub(crate) fn ensure_cipher_support(supported: bool) -> Result<()> {
    if supported {
        Ok(())
    } else {
        error!("This CPU has no AES-NI support");
        Err(CryptoError::HardwareUnsupported.into())
    }
}
