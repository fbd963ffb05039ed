//! Trust root provider configuration.

use crate::error::PolicyError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tough::Transport;
use url::Url;

/// The public Sigstore TUF repository.
pub const DEFAULT_REPOSITORY: &str = "https://tuf-repo-cdn.sigstore.dev";

/// Root metadata (version 9) of the public Sigstore repository, used to seed
/// an empty cache.
pub static EMBEDDED_ROOT: &[u8] = include_bytes!("tuf-root/root.json");

/// Which TUF repository to follow and which root to trust first.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub metadata_url: String,
    pub targets_url: String,
    pub seed_root: Arc<[u8]>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REPOSITORY, EMBEDDED_ROOT)
    }
}

impl RepositoryConfig {
    /// Metadata at `metadata_url`, targets under `<metadata_url>/targets`.
    pub fn new(metadata_url: impl Into<String>, seed_root: impl Into<Arc<[u8]>>) -> Self {
        let metadata_url = metadata_url.into().trim_end_matches('/').to_string();
        Self {
            targets_url: format!("{metadata_url}/targets"),
            metadata_url,
            seed_root: seed_root.into(),
        }
    }

    pub fn with_targets_url(mut self, targets_url: impl Into<String>) -> Self {
        self.targets_url = targets_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Metadata and targets base URLs, each ending with a slash so file
    /// names join below them.
    pub fn base_urls(&self) -> Result<(Url, Url), PolicyError> {
        Ok((base_url(&self.metadata_url)?, base_url(&self.targets_url)?))
    }
}

fn base_url(url: &str) -> Result<Url, PolicyError> {
    Url::parse(&format!("{}/", url.trim_end_matches('/')))
        .map_err(|e| PolicyError::Configuration(format!("invalid repository URL {url:?}: {e}")))
}

#[derive(Clone)]
pub struct TrustRootConfig {
    /// Directory holding the cached metadata and the cross-process lock.
    pub cache_path: PathBuf,
    /// Period of background refreshes; `None` or zero disables them.
    pub update_interval: Option<Duration>,
    /// Never serve metadata from the cache alone.
    pub require_online: bool,
    pub repository: RepositoryConfig,
    /// Replaces the HTTP transport, mostly for tests and mirrors.
    pub transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for TrustRootConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRootConfig")
            .field("cache_path", &self.cache_path)
            .field("update_interval", &self.update_interval)
            .field("require_online", &self.require_online)
            .field("repository", &self.repository.metadata_url)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

impl TrustRootConfig {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            update_interval: None,
            require_online: false,
            repository: RepositoryConfig::default(),
            transport: None,
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    pub fn with_require_online(mut self, require_online: bool) -> Self {
        self.require_online = require_online;
        self
    }

    pub fn with_repository(mut self, repository: RepositoryConfig) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// The refresh period, if periodic refresh is enabled.
    pub fn refresh_period(&self) -> Option<Duration> {
        self.update_interval.filter(|d| !d.is_zero())
    }

    /// Per-repository cache directory below `cache_path`.
    pub fn repository_dir(&self) -> PathBuf {
        self.cache_path.join(url_to_path(&self.repository.metadata_url))
    }
}

/// Flatten a repository URL into a single directory name,
/// "https://tuf-repo-cdn.sigstore.dev" becomes "tuf-repo-cdn.sigstore.dev".
pub fn url_to_path(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    without_scheme
        .trim_end_matches('/')
        .chars()
        .map(|c| if c == '/' || c == ':' { '-' } else { c })
        .collect::<String>()
        .to_lowercase()
}
