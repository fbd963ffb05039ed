//! The trust root provider.
//!
//! Each load runs `tough` over the cached root and keeps the verified
//! trusted root, parsed, as one immutable [`Material`]. Material and the
//! refresh [`Status`] live together behind a single lock so readers always see
//! material together with the status that produced it, and a refresh only
//! ever replaces both wholesale.

use super::config::TrustRootConfig;
use super::fetcher::{AirgappedFetcher, ROOT_FILE};
use super::lock::CacheLock;
use super::status::Status;
use crate::audit;
use crate::error::PolicyError;
use crate::trust::TrustedRoot;
use crate::types::TrustRootStatus;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use sigpolicy_tuf::HttpTransport;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tough::{ExpirationEnforcement, Repository, RepositoryLoader, TargetName, Transport};
use url::Url;

/// Target holding the Sigstore trusted root document.
pub const TRUSTED_ROOT_TARGET: &str = "trusted_root.json";

/// Directory below the repository cache where `tough` keeps the metadata it
/// checks for rollbacks.
const DATASTORE_DIR: &str = "datastore";

const WAIT_CEILING: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one verified load.
#[derive(Debug)]
struct Material {
    /// A repository without a usable trusted root target still loaded fine.
    root: Result<TrustedRoot, Arc<PolicyError>>,
    root_version: u64,
    targets_version: u64,
}

#[derive(Default)]
struct State {
    material: Option<Arc<Material>>,
    status: Status,
}

struct Shared {
    config: TrustRootConfig,
    repository_dir: PathBuf,
    metadata_url: Url,
    targets_url: Url,
    transport: Arc<dyn Transport>,
    state: RwLock<State>,
    shutdown: CancellationToken,
}

/// Keeps a verified copy of the Sigstore trusted root up to date.
///
/// Construction works without network access as long as the cache is usable.
/// Background refreshes stop when the provider is dropped or
/// [`TrustRootProvider::shutdown`] is called.
pub struct TrustRootProvider {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TrustRootProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRootProvider")
            .field("repository_dir", &self.shared.repository_dir)
            .field("status", &self.status())
            .finish()
    }
}

enum Wait {
    Ready(Arc<Material>, Status),
    Failed(Arc<PolicyError>),
    Cancelled,
}

enum Event {
    Cancelled,
    Retried(Result<(), Arc<PolicyError>>),
    Tick,
}

impl TrustRootProvider {
    pub async fn new(config: TrustRootConfig) -> Result<Self, PolicyError> {
        if config.cache_path.as_os_str().is_empty() {
            return Err(PolicyError::Configuration(
                "cache path must be provided for trust root provider".to_string(),
            ));
        }
        let repository_dir = config.repository_dir();
        let (metadata_url, targets_url) = config.repository.base_urls()?;
        let transport: Arc<dyn Transport> = match &config.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::default()),
        };

        {
            let cache_path = config.cache_path.clone();
            let repository_dir = repository_dir.clone();
            let seed = Arc::clone(&config.repository.seed_root);
            run_blocking(move || {
                let _lock = CacheLock::acquire(&cache_path)?;
                seed_root(&repository_dir, &seed)
            })
            .await?;
        }

        let require_online = config.require_online;
        let shared = Arc::new(Shared {
            config,
            repository_dir,
            metadata_url,
            targets_url,
            transport,
            state: RwLock::new(State::default()),
            shutdown: CancellationToken::new(),
        });

        if require_online {
            let material = shared.load(true).await?;
            shared.install(material);
        } else {
            match shared.load(false).await {
                Ok(material) => {
                    let mut state = shared.state.write().unwrap_or_else(|e| e.into_inner());
                    state.material = Some(Arc::new(material));
                }
                Err(e) => log::warn!(
                    "no usable trust metadata cached in {}, waiting for an online refresh: {e}",
                    shared.repository_dir.display()
                ),
            }
        }

        let provider = Self { shared };
        provider.start_background(!require_online);
        Ok(provider)
    }

    /// Pull and verify the latest metadata now.
    ///
    /// On failure the previously served material stays in place and only the
    /// status records the error.
    pub async fn refresh(&self) -> Result<(), Arc<PolicyError>> {
        self.shared.refresh().await
    }

    /// The current trusted root together with the status of the latest
    /// refresh attempt.
    ///
    /// Waits at most five seconds, or until `cancel` fires, for a first
    /// successful refresh. When none arrives the metadata loaded from the
    /// cache at construction is used instead and the status carries the
    /// reason.
    pub async fn trusted_root(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(TrustedRoot, TrustRootStatus), Arc<PolicyError>> {
        let waited = tokio::time::timeout(WAIT_CEILING, self.wait(cancel))
            .await
            .unwrap_or_else(|_| {
                Wait::Failed(Arc::new(PolicyError::NotYetAvailable(format!(
                    "no trust root refresh completed within {}s",
                    WAIT_CEILING.as_secs()
                ))))
            });

        let (material, status, fallback_error) = match waited {
            Wait::Ready(material, status) => (Some(material), status, None),
            Wait::Cancelled => {
                return Err(Arc::new(PolicyError::NotYetAvailable(
                    "cancelled while waiting for the first trust root refresh".to_string(),
                )));
            }
            Wait::Failed(error) => {
                let (material, status) = self.shared.snapshot();
                (material, status.failed(Arc::clone(&error)), Some(error))
            }
        };

        let root = match material.as_ref().map(|m| &m.root) {
            Some(Ok(root)) => root.clone(),
            // Without a first success the wait error says more than a missing target.
            Some(Err(e)) => return Err(fallback_error.unwrap_or_else(|| Arc::clone(e))),
            None => {
                return Err(fallback_error.unwrap_or_else(|| {
                    Arc::new(PolicyError::NotYetAvailable(
                        "no trust metadata has been loaded".to_string(),
                    ))
                }))
            }
        };

        if let Some(error) = &fallback_error {
            log::warn!("serving trust root from unrefreshed metadata: {error}");
        }
        Ok((root, TrustRootStatus::from(&status)))
    }

    pub fn status(&self) -> TrustRootStatus {
        TrustRootStatus::from(&self.shared.snapshot().1)
    }

    /// Directory holding the cached metadata of the configured repository.
    pub fn repository_dir(&self) -> &Path {
        &self.shared.repository_dir
    }

    /// Root and targets metadata versions of the material being served.
    pub fn metadata_versions(&self) -> Option<(u64, u64)> {
        self.shared
            .snapshot()
            .0
            .map(|m| (m.root_version, m.targets_version))
    }

    /// Stop background refreshes. Calls in progress are not interrupted.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    async fn wait(&self, cancel: &CancellationToken) -> Wait {
        let mut retry: Option<JoinHandle<Result<(), Arc<PolicyError>>>> = None;
        let mut retried = false;
        loop {
            let (material, status) = self.shared.snapshot();
            if let (true, Some(material)) = (status.has_succeeded(), material) {
                return Wait::Ready(material, status);
            }
            // The last attempt failed; the cause may be gone by now.
            if status.is_degraded() && !retried {
                retried = true;
                let shared = Arc::clone(&self.shared);
                retry = Some(tokio::spawn(async move { shared.refresh().await }));
            }

            let event = tokio::select! {
                _ = cancel.cancelled() => Event::Cancelled,
                result = join_retry(&mut retry) => Event::Retried(result),
                _ = tokio::time::sleep(POLL_INTERVAL) => Event::Tick,
            };
            match event {
                Event::Cancelled => return Wait::Cancelled,
                Event::Retried(Err(error)) => return Wait::Failed(error),
                Event::Retried(Ok(())) => retry = None,
                Event::Tick => {}
            }
        }
    }

    /// `refresh_now` starts an immediate refresh besides the periodic ones.
    fn start_background(&self, refresh_now: bool) {
        if refresh_now {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let shutdown = shared.shutdown.clone();
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = shared.refresh() => {}
                }
            });
        }

        let Some(period) = self.shared.config.refresh_period() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = shared.refresh().await;
                    }
                }
            }
            log::debug!("periodic trust root refresh stopped");
        });
    }
}

impl Drop for TrustRootProvider {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn snapshot(&self) -> (Option<Arc<Material>>, Status) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        (state.material.clone(), state.status.clone())
    }

    async fn refresh(&self) -> Result<(), Arc<PolicyError>> {
        match self.load(true).await {
            Ok(material) => {
                self.install(material);
                Ok(())
            }
            Err(error) => {
                let error = Arc::new(error);
                let repository = &self.config.repository.metadata_url;
                audit::log_refresh_failure(repository, &error.to_string());
                log::warn!("trust metadata refresh from {repository} failed: {error}");
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                state.status = state.status.failed(Arc::clone(&error));
                Err(error)
            }
        }
    }

    /// Serve `material` from now on as the result of a successful refresh.
    fn install(&self, material: Material) {
        let repository = &self.config.repository.metadata_url;
        audit::log_refresh_success(
            repository,
            material.root_version,
            Some(material.targets_version),
        );
        log::info!(
            "trust metadata refreshed from {repository} (root v{}, targets v{})",
            material.root_version,
            material.targets_version
        );
        if let Err(e) = &material.root {
            log::warn!("refreshed metadata carries no usable trusted root: {e}");
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.material = Some(Arc::new(material));
        state.status = Status::succeeded(Utc::now());
    }

    /// Verify the repository starting from the cached root, over the network
    /// when `online`, otherwise from the cache alone.
    ///
    /// An online load holds the cache lock throughout, since `tough` updates
    /// its datastore as it goes; downloads are committed only once everything
    /// verified. A cache-only load runs unlocked.
    async fn load(&self, online: bool) -> Result<Material, PolicyError> {
        let _lock = if online {
            let cache_path = self.config.cache_path.clone();
            Some(run_blocking(move || CacheLock::acquire(&cache_path)).await?)
        } else {
            None
        };

        let root_path = self.repository_dir.join(ROOT_FILE);
        let root = fs::read(&root_path).map_err(|source| cache_error(&root_path, source))?;
        let datastore = self.repository_dir.join(DATASTORE_DIR);
        fs::create_dir_all(&datastore).map_err(|source| cache_error(&datastore, source))?;

        let fetcher = AirgappedFetcher::new(
            Arc::clone(&self.transport),
            &self.metadata_url,
            &self.targets_url,
            &self.repository_dir,
        )
        .with_online(online);
        let repository = RepositoryLoader::new(
            &root,
            self.metadata_url.clone(),
            self.targets_url.clone(),
        )
        .transport(fetcher.clone())
        .datastore(datastore)
        .expiration_enforcement(ExpirationEnforcement::Safe)
        .load()
        .await?;
        let target = read_target(&repository, TRUSTED_ROOT_TARGET).await?;
        fetcher.commit()?;

        let root = match target {
            Some(bytes) => TrustedRoot::from_json(&bytes).map_err(Arc::new),
            None => Err(Arc::new(PolicyError::TrustMaterialMalformed(format!(
                "repository has no {TRUSTED_ROOT_TARGET} target"
            )))),
        };
        Ok(Material {
            root,
            root_version: repository.root().signed.version.get(),
            targets_version: repository.targets().signed.version.get(),
        })
    }
}

/// The verified contents of target `name`, `None` if the repository does not
/// list it.
async fn read_target(repository: &Repository, name: &str) -> Result<Option<Bytes>, PolicyError> {
    let name = TargetName::new(name)?;
    let Some(stream) = repository.read_target(&name).await? else {
        return Ok(None);
    };
    let chunks: Vec<Bytes> = stream.try_collect().await?;
    Ok(Some(Bytes::from(chunks.concat())))
}

fn seed_root(repository_dir: &Path, seed: &[u8]) -> Result<(), PolicyError> {
    let path = repository_dir.join(ROOT_FILE);
    match fs::symlink_metadata(&path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(repository_dir).map_err(|source| cache_error(repository_dir, source))?;
            fs::write(&path, seed).map_err(|source| cache_error(&path, source))?;
            log::info!("initialized trust metadata cache {}", repository_dir.display());
            Ok(())
        }
        Err(source) => Err(cache_error(&path, source)),
    }
}

fn cache_error(path: &Path, source: io::Error) -> PolicyError {
    PolicyError::Cache {
        path: path.display().to_string(),
        source,
    }
}

async fn join_retry(
    retry: &mut Option<JoinHandle<Result<(), Arc<PolicyError>>>>,
) -> Result<(), Arc<PolicyError>> {
    match retry {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            Err(Arc::new(PolicyError::Internal(format!("refresh task failed: {e}"))))
        }),
        None => std::future::pending().await,
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, PolicyError>
where
    F: FnOnce() -> Result<T, PolicyError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PolicyError::Internal(format!("blocking task failed: {e}")))?
}
