//! Artifact verification against the continuously refreshed trust root.
//!
//! [`Verifier::verify_artifact`] accepts any Sigstore signer whose
//! certificate says it ran on a GitHub-hosted runner, and requires one
//! verified SCT, one transparency log entry and one observer timestamp.

use crate::audit;
use crate::bundle::{Bundle, BundleVersion, Content};
use crate::error::PolicyError;
use crate::roots::{RepositoryConfig, TrustRootConfig, TrustRootProvider};
use crate::trust::TrustedRoot;
use crate::types::{SignatureInfo, SignatureType, TimestampVerificationResult, TrustRootStatus};
use crate::verify::{
    ArtifactDigest, IdentityPolicy, Policy, SigstoreEngine, VerificationEngine, VerificationError,
};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tough::Transport;

const HASHEDREKORD: &str = "hashedrekord";

/// Runner environment every accepted signer must report.
pub const REQUIRED_RUNNER_ENVIRONMENT: &str = "github-hosted";

/// Where verified trust material comes from.
#[async_trait]
pub trait TrustRootSource: Send + Sync {
    async fn trusted_root(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(TrustedRoot, TrustRootStatus), Arc<PolicyError>>;
}

#[async_trait]
impl TrustRootSource for TrustRootProvider {
    async fn trusted_root(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(TrustedRoot, TrustRootStatus), Arc<PolicyError>> {
        TrustRootProvider::trusted_root(self, cancel).await
    }
}

#[derive(Clone)]
pub struct VerifierConfig {
    /// Directory for persistent state; trust metadata goes to `<state_dir>/tuf`.
    pub state_dir: PathBuf,
    pub update_interval: Option<Duration>,
    pub require_online: bool,
    pub repository: RepositoryConfig,
    pub transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for VerifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierConfig")
            .field("state_dir", &self.state_dir)
            .field("update_interval", &self.update_interval)
            .field("require_online", &self.require_online)
            .field("repository", &self.repository.metadata_url)
            .finish()
    }
}

impl VerifierConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
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

    pub fn trust_root_config(&self) -> TrustRootConfig {
        let mut config = TrustRootConfig::new(self.state_dir.join("tuf"))
            .with_require_online(self.require_online)
            .with_repository(self.repository.clone());
        config.update_interval = self.update_interval;
        config.transport = self.transport.clone();
        config
    }
}

type SharedOutcome<V> = Shared<BoxFuture<'static, Result<V, Arc<PolicyError>>>>;

enum Slot<V> {
    Idle,
    Running(SharedOutcome<V>),
    Done(V),
}

/// Runs an initialization at most once at a time.
///
/// Callers arriving while it runs share its outcome. A success is kept for
/// good; a failure is handed to everyone who waited for it and the next
/// caller starts over.
pub struct SingleFlight<V> {
    slot: Mutex<Slot<V>>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn get(&self) -> Option<V> {
        match &*self.slot.lock().unwrap_or_else(|e| e.into_inner()) {
            Slot::Done(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<V, Arc<PolicyError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, PolicyError>> + Send + 'static,
    {
        let flight = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            let running = match &*slot {
                Slot::Done(value) => return Ok(value.clone()),
                Slot::Running(flight) => Some(flight.clone()),
                Slot::Idle => None,
            };
            match running {
                Some(flight) => flight,
                None => {
                    let flight = init().map(|r| r.map_err(Arc::new)).boxed().shared();
                    *slot = Slot::Running(flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        // A later flight may already have replaced a failed one.
        if matches!(&*slot, Slot::Running(current) if current.ptr_eq(&flight)) {
            *slot = match &outcome {
                Ok(value) => Slot::Done(value.clone()),
                Err(_) => Slot::Idle,
            };
        }
        outcome
    }
}

type Connect =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn TrustRootSource>, PolicyError>> + Send + Sync>;

pub struct Verifier {
    engine: Arc<dyn VerificationEngine>,
    connect: Connect,
    source: SingleFlight<Arc<dyn TrustRootSource>>,
}

impl Verifier {
    /// Build a verifier and start its trust root provider.
    ///
    /// A provider that cannot start yet is retried on first use. Only trust
    /// metadata that has already expired fails construction.
    pub async fn new(config: VerifierConfig) -> Result<Self, PolicyError> {
        if config.state_dir.as_os_str().is_empty() {
            return Err(PolicyError::Configuration(
                "state directory must be provided".to_string(),
            ));
        }
        let trust_config = config.trust_root_config();
        let verifier = Self::from_parts(Arc::new(SigstoreEngine::default()), move || {
            let trust_config = trust_config.clone();
            async move {
                log::debug!("starting trust root provider in {}", trust_config.cache_path.display());
                let provider = TrustRootProvider::new(trust_config).await?;
                Ok::<_, PolicyError>(Arc::new(provider) as Arc<dyn TrustRootSource>)
            }
        });
        verifier.warm_up().await?;
        Ok(verifier)
    }

    /// A verifier over any engine and trust root source. `connect` is called
    /// lazily, and never concurrently, until it first succeeds.
    pub fn from_parts<F, Fut>(engine: Arc<dyn VerificationEngine>, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn TrustRootSource>, PolicyError>> + Send + 'static,
    {
        Self {
            engine,
            connect: Box::new(move || connect().boxed()),
            source: SingleFlight::default(),
        }
    }

    /// Verify that `bundle` signs the artifact with `digest` ("sha256:<hex>").
    pub async fn verify_artifact(
        &self,
        cancel: &CancellationToken,
        digest: &str,
        bundle: &[u8],
    ) -> Result<SignatureInfo, PolicyError> {
        let correlation_id = audit::new_correlation_id();
        audit::log_verification_attempt(&correlation_id, digest);

        let outcome = self.verify(cancel, digest, bundle).await;
        match &outcome {
            Ok(info) => audit::log_verification_success(
                &correlation_id,
                digest,
                info.signer.as_ref().map(|s| s.subject_alternative_name.as_str()),
                info.signer.as_ref().map(|s| s.extensions.issuer.as_str()),
                info.timestamps.len(),
            ),
            Err(e) => {
                audit::log_verification_failure(&correlation_id, digest, e.kind(), &e.to_string())
            }
        }
        outcome
    }

    async fn verify(
        &self,
        cancel: &CancellationToken,
        digest: &str,
        bundle: &[u8],
    ) -> Result<SignatureInfo, PolicyError> {
        let policy = acceptance_policy(digest)?;
        let bundle = Bundle::from_json(bundle)?;

        let source = self
            .trust_root_source()
            .await
            .map_err(PolicyError::TrustUnavailable)?;
        let (trusted_root, status) = source
            .trusted_root(cancel)
            .await
            .map_err(PolicyError::TrustUnavailable)?;
        if let Some(error) = &status.error {
            log::warn!("verifying with degraded trust root: {error}");
        }

        let result = self
            .engine
            .verify(&bundle, &trusted_root, &policy)
            .map_err(|e| match e {
                VerificationError::MissingCertificate | VerificationError::MissingSignature => {
                    PolicyError::NoValidSignature
                }
                e => PolicyError::VerificationFailed(e),
            })?;
        let signer = result
            .signature
            .and_then(|s| s.certificate)
            .ok_or(PolicyError::NoValidSignature)?;

        let mut info = SignatureInfo {
            signature_type: signature_type(&bundle),
            signer: Some(signer),
            timestamps: result
                .verified_timestamps
                .into_iter()
                .map(|t| TimestampVerificationResult {
                    kind: t.kind,
                    uri: t.uri,
                    timestamp: t.timestamp,
                })
                .collect(),
            trust_root_status: status,
            ..SignatureInfo::default()
        };
        info.kind = info.detect_kind();
        Ok(info)
    }

    async fn trust_root_source(&self) -> Result<Arc<dyn TrustRootSource>, Arc<PolicyError>> {
        self.source.get_or_try_init(|| (self.connect)()).await
    }

    async fn warm_up(&self) -> Result<(), PolicyError> {
        let first = match self.trust_root_source().await {
            Ok(source) => source.trusted_root(&CancellationToken::new()).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match first {
            Ok(()) => Ok(()),
            Err(e) if e.is_expired_metadata() => Err(PolicyError::TrustUnavailable(e)),
            Err(e) => {
                log::warn!("trust root not available yet, retrying on first use: {e}");
                Ok(())
            }
        }
    }
}

/// Pre-0.3 bundles around a plain message signature come from cosign simple
/// signing, recorded in the log as hashedrekord entries.
fn signature_type(bundle: &Bundle) -> SignatureType {
    match (bundle.version, &bundle.content) {
        (BundleVersion::V03, _) => SignatureType::BUNDLE_V03,
        (_, Some(Content::MessageSignature { .. }))
            if !bundle.tlog_entries.is_empty()
                && bundle.tlog_entries.iter().all(|e| e.kind == HASHEDREKORD) =>
        {
            SignatureType::SIMPLE_SIGNING_V1
        }
        _ => SignatureType::UNKNOWN,
    }
}

/// Split "<algorithm>:<hex>" into its parts.
pub fn parse_digest(digest: &str) -> Result<ArtifactDigest, PolicyError> {
    let invalid = |reason: String| PolicyError::InvalidDigest {
        digest: digest.to_string(),
        reason,
    };
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| invalid("expected <algorithm>:<hex>".to_string()))?;
    if algorithm.is_empty() || encoded.is_empty() {
        return Err(invalid("expected <algorithm>:<hex>".to_string()));
    }
    let value = hex::decode(encoded).map_err(|e| invalid(format!("invalid hex: {e}")))?;
    let expected = match algorithm {
        "sha256" => Some(32),
        "sha384" => Some(48),
        "sha512" => Some(64),
        _ => None,
    };
    if let Some(expected) = expected {
        if value.len() != expected {
            return Err(invalid(format!(
                "{algorithm} digests are {expected} bytes, got {}",
                value.len()
            )));
        }
    }
    Ok(ArtifactDigest {
        algorithm: algorithm.to_string(),
        value,
    })
}

fn acceptance_policy(digest: &str) -> Result<Policy, PolicyError> {
    let artifact = parse_digest(digest)?;
    let identity = IdentityPolicy::new(".*", ".*")
        .map_err(|e| PolicyError::Internal(e.to_string()))?
        .with_extension("runnerEnvironment", REQUIRED_RUNNER_ENVIRONMENT);
    Ok(Policy { identity, artifact })
}
