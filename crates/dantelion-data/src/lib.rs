//! Random-access reads from encrypted BHD5/BDT game archives.
//!
//! A game installation ships its assets as pairs of files: a small RSA
//! encrypted header (`.bhd`) listing every stored file, and a large data file
//! (`.bdt`) holding the payloads. Some payloads have AES-128 encrypted ranges.
//!
//! The crate is organised along the read pipeline:
//!
//! - **Bootstrap** ([`bootstrap`]): discover headers, resolve keys (local key
//!   store, then remote), validate or rebuild the header cache and parse each
//!   header into an index, one blocking worker per archive
//! - **Header cache** ([`header_cache`]): `[md5][decrypted header]` files that
//!   make RSA decryption a one-time cost
//! - **Read path** ([`reader`]): bounds-checked reads from the data file with
//!   per-range ECB decryption
//! - **Read surface** ([`EncryptedData`], [`LooseData`]): path normalization,
//!   hashing and lookup across every archive
//!
//! Parsing the header's binary layout is delegated to an [`IndexParser`]
//! supplied by the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use dantelion_data::{DataConfig, EncryptedData, Game};
//! use std::sync::Arc;
//!
//! # async fn example(parser: Arc<dyn dantelion_data::IndexParser>) -> dantelion_data::Result<()> {
//! let config = DataConfig::new("/games/ELDEN RING/Game", Game::EldenRing);
//! let data = EncryptedData::open(config, parser).await?;
//!
//! if let Some(bytes) = data.get("regulation.bin")? {
//!     println!("regulation.bin: {} bytes", bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::path::PathBuf;

use thiserror::Error;

// Archive startup
pub mod bootstrap;

// Configuration
pub mod config;

// Read surface over encrypted archives
pub mod encrypted;

// Persistent decrypted header cache
pub mod header_cache;

// External index interface
pub mod index;

// Local key store
pub mod keys;

// Read surface over unpacked game directories
pub mod loose;

// Output directory for extracted files
pub mod output;

// File name patterns
pub mod pattern;

// Selective-decrypt read path
pub mod reader;

// Remote key source
pub mod remote;

// Shared data model
pub mod types;

pub use bootstrap::{Archive, ArchiveBootstrap, ArchiveState, Bootstrapped};
pub use config::{DataConfig, RemoteConfig};
pub use encrypted::{Coverage, EncryptedData};
pub use header_cache::HeaderCache;
pub use index::{ArchiveIndex, FileTable, FileTableBuilder, IndexParser};
pub use keys::KeyStore;
pub use loose::LooseData;
pub use output::OutputDir;
pub use pattern::PathPattern;
pub use reader::{EnginePool, ReadDiagnostics, SelectiveDecryptor};
pub use remote::RemoteKeySource;
pub use types::{AesRange, ArchiveId, FileEntry, FileKey, Game, normalize_path};

/// Result type for data operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors that can occur while opening or reading archives.
#[derive(Debug, Error)]
pub enum DataError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cipher or header decryption failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] dantelion_crypto::CryptoError),

    /// HTTP request to the remote key source failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration could not be loaded or saved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No `.bhd` headers were found under the game root.
    #[error("No archive headers found in {0}")]
    NoArchives(PathBuf),

    /// The named archive is not part of this installation.
    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    /// A decrypted header could not be turned into an index.
    #[error("Index error: {0}")]
    Index(String),

    /// A file entry points outside its data file.
    #[error("Read out of bounds: offset {offset}, size {size}, data file length {len}")]
    OutOfBounds {
        /// Declared file offset
        offset: i64,
        /// Declared padded size
        size: i64,
        /// Length of the data file
        len: u64,
    },

    /// A path escapes the directory it is resolved against.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A file name pattern could not be compiled.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A bootstrap worker panicked or was cancelled.
    #[error("Worker failed: {0}")]
    Worker(String),
}

/// Version information for the data crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extension of encrypted archive headers.
pub const HEADER_EXTENSION: &str = "bhd";

/// Extension of archive data files.
pub const DATA_EXTENSION: &str = "bdt";

/// Extension of decrypted header cache files.
pub const CACHE_EXTENSION: &str = "bhdcache";

/// Extension of compressed container files.
pub const DCX_EXTENSION: &str = "dcx";

/// Name of the key store file inside the per-game data directory.
pub const KEYS_FILE: &str = "keys";

/// Name of the header cache directory inside the per-game data directory.
pub const CACHE_DIR: &str = ".cache";

/// Logical path of the game's parameter regulation file.
pub const REGULATION_PATH: &str = "/regulation.bin";
