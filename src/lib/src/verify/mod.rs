//! Sigstore bundle verification.
//!
//! [`SigstoreEngine`] checks a [`Bundle`] against a [`TrustedRoot`] and a
//! [`Policy`]:
//!
//! 1. the leaf certificate is parsed and summarized
//! 2. embedded SCTs are verified against the CT logs
//! 3. transparency log entries are bound to the bundle and proven
//! 4. verified integrated times and RFC 3161 timestamps become observer
//!    timestamps
//! 5. the certificate chain is validated at every observer timestamp
//! 6. the signature is verified over the artifact digest
//! 7. the signer identity is checked against the policy
//!
//! Each count is compared with a [`Thresholds`] minimum.

pub mod certificate;
pub mod chain;
pub mod merkle;
pub mod policy;
pub mod sct;
pub mod signature;
pub mod timestamp;
pub mod tlog;

pub use certificate::{CertificateSummary, Extensions};
pub use policy::{IdentityPolicy, Policy};
pub use signature::ArtifactDigest;

use crate::bundle::Bundle;
use crate::trust::TrustedRoot;
use certificate::LeafCertificate;
use chrono::{DateTime, Utc};

/// [`TimestampResult::kind`] of log integrated times.
pub const TLOG: &str = "Tlog";
/// [`TimestampResult::kind`] of RFC 3161 timestamps.
pub const TIMESTAMP_AUTHORITY: &str = "TimestampAuthority";

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("bundle carries no signing certificate")]
    MissingCertificate,

    #[error("bundle carries no signature")]
    MissingSignature,

    #[error("certificate: {0}")]
    Certificate(String),

    #[error("signed certificate timestamp: {0}")]
    Sct(String),

    #[error("transparency log: {0}")]
    Tlog(String),

    #[error("signed timestamp: {0}")]
    Timestamp(String),

    #[error("not enough verified {what}: found {found}, need {required}")]
    ThresholdNotMet {
        what: &'static str,
        found: usize,
        required: usize,
    },

    #[error("certificate chain: {0}")]
    Chain(String),

    #[error("signature: {0}")]
    Signature(String),

    #[error("policy: {0}")]
    Policy(String),

    #[error("unsupported key: {0}")]
    UnsupportedKey(String),
}

/// Minimum number of independently verified items of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub sct: usize,
    pub tlog: usize,
    pub observer_timestamps: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            sct: 1,
            tlog: 1,
            observer_timestamps: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampResult {
    /// [`TLOG`] or [`TIMESTAMP_AUTHORITY`].
    pub kind: String,
    pub uri: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureResult {
    pub certificate: Option<CertificateSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationResult {
    pub media_type: String,
    pub signature: Option<SignatureResult>,
    pub verified_timestamps: Vec<TimestampResult>,
}

/// Something that can decide whether a bundle is valid under a policy.
pub trait VerificationEngine: Send + Sync {
    fn verify(
        &self,
        bundle: &Bundle,
        trusted_root: &TrustedRoot,
        policy: &Policy,
    ) -> Result<VerificationResult, VerificationError>;
}

#[derive(Debug, Clone, Default)]
pub struct SigstoreEngine {
    thresholds: Thresholds,
}

impl SigstoreEngine {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    fn require(&self, what: &'static str, found: usize, required: usize) -> Result<(), VerificationError> {
        if found < required {
            return Err(VerificationError::ThresholdNotMet {
                what,
                found,
                required,
            });
        }
        Ok(())
    }
}

impl VerificationEngine for SigstoreEngine {
    fn verify(
        &self,
        bundle: &Bundle,
        trusted_root: &TrustedRoot,
        policy: &Policy,
    ) -> Result<VerificationResult, VerificationError> {
        let leaf_der = bundle
            .leaf_certificate()
            .ok_or(VerificationError::MissingCertificate)?;
        let content = bundle
            .content
            .as_ref()
            .ok_or(VerificationError::MissingSignature)?;
        let leaf = LeafCertificate::parse(leaf_der)?;

        if self.thresholds.sct > 0 {
            let scts = sct::verify_embedded_scts(&leaf, trusted_root)?;
            self.require("signed certificate timestamps", scts, self.thresholds.sct)?;
        }

        let outcome = tlog::verify_entries(bundle, leaf_der, trusted_root)?;
        self.require("transparency log entries", outcome.verified_entries, self.thresholds.tlog)?;

        let observed: Vec<(&str, tlog::ObserverTimestamp)> = outcome
            .timestamps
            .into_iter()
            .map(|t| (TLOG, t))
            .chain(
                timestamp::verify_signed_timestamps(bundle, trusted_root)
                    .into_iter()
                    .map(|t| (TIMESTAMP_AUTHORITY, t)),
            )
            .collect();
        self.require(
            "observer timestamps",
            observed.len(),
            self.thresholds.observer_timestamps,
        )?;

        let extra_intermediates = bundle.certificates.get(1..).unwrap_or_default();
        for (_, t) in &observed {
            chain::verify_chain_at(leaf_der, extra_intermediates, trusted_root, t.time)?;
        }

        signature::verify_content(content, &leaf.public_key, &policy.artifact)?;
        policy.identity.check(&leaf.summary)?;

        Ok(VerificationResult {
            media_type: bundle.media_type.clone(),
            signature: Some(SignatureResult {
                certificate: Some(leaf.summary),
            }),
            verified_timestamps: observed
                .into_iter()
                .map(|(kind, t)| TimestampResult {
                    kind: kind.to_string(),
                    uri: t.uri,
                    timestamp: t.time,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIFACT_SHA256: &str =
        "a93115d2e627eb21f9cf19f34f02c100fe6e8db576235bc5c08264bdd8085a37";

    fn policy() -> Policy {
        Policy {
            identity: IdentityPolicy::new(".*", ".*")
                .unwrap()
                .with_extension("runnerEnvironment", "github-hosted"),
            artifact: ArtifactDigest {
                algorithm: "sha256".to_string(),
                value: hex::decode(ARTIFACT_SHA256).unwrap(),
            },
        }
    }

    fn root() -> TrustedRoot {
        TrustedRoot::from_json(include_bytes!("../../tests/fixtures/trusted_root.json")).unwrap()
    }

    #[test]
    fn test_engine_verifies_fixture() {
        let bundle =
            Bundle::from_json(include_bytes!("../../tests/fixtures/bundle-v03.json")).unwrap();
        let result = SigstoreEngine::default().verify(&bundle, &root(), &policy()).unwrap();
        let summary = result.signature.unwrap().certificate.unwrap();
        assert_eq!(summary.extensions.runner_environment, "github-hosted");
        assert_eq!(result.verified_timestamps.len(), 1);
        assert_eq!(result.verified_timestamps[0].kind, "Tlog");
    }

    #[test]
    fn test_engine_missing_parts() {
        let mut bundle =
            Bundle::from_json(include_bytes!("../../tests/fixtures/bundle-v03.json")).unwrap();
        bundle.content = None;
        assert!(matches!(
            SigstoreEngine::default().verify(&bundle, &root(), &policy()),
            Err(VerificationError::MissingSignature)
        ));
        bundle.certificates.clear();
        assert!(matches!(
            SigstoreEngine::default().verify(&bundle, &root(), &policy()),
            Err(VerificationError::MissingCertificate)
        ));
    }

    #[test]
    fn test_engine_thresholds() {
        let mut bundle =
            Bundle::from_json(include_bytes!("../../tests/fixtures/bundle-v03.json")).unwrap();
        bundle.tlog_entries.clear();
        let err = SigstoreEngine::default()
            .verify(&bundle, &root(), &policy())
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::ThresholdNotMet { found: 0, required: 1, .. }
        ));

        let mut no_ct = root();
        no_ct.ctlogs.clear();
        let bundle =
            Bundle::from_json(include_bytes!("../../tests/fixtures/bundle-v03.json")).unwrap();
        let err = SigstoreEngine::default()
            .verify(&bundle, &no_ct, &policy())
            .unwrap_err();
        assert!(err.to_string().contains("signed certificate timestamps"));

        let relaxed = SigstoreEngine::new(Thresholds {
            sct: 0,
            ..Thresholds::default()
        });
        relaxed.verify(&bundle, &no_ct, &policy()).unwrap();
    }

    #[test]
    fn test_engine_counts_authority_timestamps() {
        let bundle =
            Bundle::from_json(include_bytes!("../../tests/fixtures/bundle-v03-tsa.json")).unwrap();
        assert!(bundle.tlog_entries[0].inclusion_promise.is_none());
        let result = SigstoreEngine::default().verify(&bundle, &root(), &policy()).unwrap();
        assert_eq!(result.verified_timestamps.len(), 1);
        assert_eq!(result.verified_timestamps[0].kind, TIMESTAMP_AUTHORITY);
        assert_eq!(result.verified_timestamps[0].uri, "https://tsa.sigpolicy.test");
        assert_eq!(result.verified_timestamps[0].timestamp.timestamp(), 1740830405);

        let mut no_tsa = root();
        no_tsa.timestamp_authorities.clear();
        let err = SigstoreEngine::default()
            .verify(&bundle, &no_tsa, &policy())
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::ThresholdNotMet { what: "observer timestamps", found: 0, required: 1 }
        ));
    }

    #[test]
    fn test_engine_policy_rejects_self_hosted() {
        let bundle = Bundle::from_json(include_bytes!(
            "../../tests/fixtures/bundle-v03-self-hosted.json"
        ))
        .unwrap();
        let err = SigstoreEngine::default()
            .verify(&bundle, &root(), &policy())
            .unwrap_err();
        assert!(matches!(err, VerificationError::Policy(_)));
    }
}
