//! Configuration for opening a game installation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Game;
use crate::{CACHE_DIR, DataError, KEYS_FILE, Result};

/// Default location of the remote key repository
pub const DEFAULT_REMOTE_BASE_URL: &str =
    "https://raw.githubusercontent.com/JKAnderson/BinderKeys/refs/heads/main";

/// Configuration for the remote key source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL; keys live at `<base>/<GameFolder>/Key/<name>.txt`
    pub base_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REMOTE_BASE_URL.to_string(),
            timeout_secs: 30,
            user_agent: format!("dantelion-data/{}", crate::VERSION),
        }
    }
}

impl RemoteConfig {
    /// Create a configuration pointing at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Request timeout
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Set the request timeout
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the user agent
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Configuration for an encrypted game installation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Game directory holding the `.bhd`/`.bdt` pairs
    pub game_root: PathBuf,

    /// Title installed at `game_root`
    pub game: Game,

    /// Directory holding `<game>/keys` and `<game>/.cache`
    pub data_dir: PathBuf,

    /// Rename stale header caches instead of deleting them
    pub keep_old_cache: bool,

    /// Maximum number of archives bootstrapped concurrently
    pub max_workers: usize,

    /// Remote key source, consulted for archives the key store has no key for
    pub remote: Option<RemoteConfig>,
}

impl DataConfig {
    /// Create a configuration for `game` installed at `game_root`
    pub fn new<P: AsRef<Path>>(game_root: P, game: Game) -> Self {
        let workers = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            game_root: game_root.as_ref().to_path_buf(),
            game,
            data_dir: PathBuf::from("Data"),
            keep_old_cache: false,
            max_workers: workers,
            remote: Some(RemoteConfig::default()),
        }
    }

    /// Set the data directory
    #[must_use]
    pub fn with_data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// Keep stale header caches under a digest-suffixed name
    #[must_use]
    pub const fn with_keep_old_cache(mut self, keep: bool) -> Self {
        self.keep_old_cache = keep;
        self
    }

    /// Set the bootstrap worker limit (at least one)
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Set or disable the remote key source
    #[must_use]
    pub fn with_remote(mut self, remote: Option<RemoteConfig>) -> Self {
        self.remote = remote;
        self
    }

    /// Per-game directory inside the data directory
    pub fn game_data_dir(&self) -> PathBuf {
        self.data_dir.join(self.game.dir_name())
    }

    /// Header cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.game_data_dir().join(CACHE_DIR)
    }

    /// Key store file
    pub fn keys_path(&self) -> PathBuf {
        self.game_data_dir().join(KEYS_FILE)
    }

    /// Load a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| DataError::Config(e.to_string()))
    }

    /// Save the configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text =
            serde_json::to_string_pretty(self).map_err(|e| DataError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
