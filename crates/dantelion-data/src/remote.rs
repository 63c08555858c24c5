//! Remote source of RSA header keys
//!
//! Keys are published as plain text files, one per archive:
//! `<base>/<GameFolder>/Key/<name>.txt`, where `<name>` is the last segment
//! of the archive id (`sd/sd` → `sd`).

use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::RemoteConfig;
use crate::types::{ArchiveId, Game};

/// HTTP client for the remote key repository
#[derive(Debug, Clone)]
pub struct RemoteKeySource {
    client: Client,
    base_url: String,
    game: Game,
}

impl RemoteKeySource {
    /// Create a key source for `game`
    pub fn new(config: &RemoteConfig, game: Game) -> Result<Self> {
        // reqwest is built without a bundled crypto provider
        let _ = rustls::crypto::ring::default_provider().install_default();

        let client = ClientBuilder::new()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.as_str())
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            game,
        })
    }

    /// URL of the key for `archive`
    pub fn key_url(&self, archive: &ArchiveId) -> String {
        format!(
            "{}/{}/Key/{}.txt",
            self.base_url,
            self.game.remote_folder(),
            archive.file_name()
        )
    }

    /// Fetch the key for `archive`.
    ///
    /// A non-success status means the repository has no key for it and yields
    /// `Ok(None)`; transport failures are errors.
    pub async fn fetch_key(&self, archive: &ArchiveId) -> Result<Option<String>> {
        let url = self.key_url(archive);
        debug!("Fetching key for {} from {}", archive, url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("No remote key for {} ({})", archive, status);
            return Ok(None);
        }

        let body = response.text().await?;
        let pem = body
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if pem.is_empty() {
            warn!("Remote key for {} is empty", archive);
            return Ok(None);
        }

        info!("Fetched remote key for {}", archive);
        Ok(Some(pem + "\n"))
    }
}
