//! Sigstore provenance verification backed by a continuously refreshed TUF
//! trust root.

// `Verifier::verify_artifact()` is what most callers need; `SignatureInfo::name()`
// turns its result into a one-line provenance label.

#![forbid(unsafe_code)]

mod error;

/// Audit logging
///
/// Structured `tracing` events for verification attempts and trust root
/// refreshes, kept apart from the diagnostic `log` output.
pub mod audit;

/// Sigstore bundle decoding (v0.1 to v0.3, JSON encoding).
pub mod bundle;

/// Trust root provider
///
/// Keeps a verified, locally cached copy of the Sigstore trusted root. The
/// cache is shared safely between processes and stays usable without network
/// access.
pub mod roots;

/// The Sigstore trusted root document: CAs, transparency logs and CT logs.
pub mod trust;

/// Verification results and provenance classification.
pub mod types;

/// Bundle verification engine
///
/// Certificate chain, SCT, transparency log, signature and identity checks.
pub mod verify;

mod verifier;

pub use error::*;
pub use verifier::{
    parse_digest, SingleFlight, TrustRootSource, Verifier, VerifierConfig,
    REQUIRED_RUNNER_ENVIRONMENT,
};

pub mod reexports {
    pub use {chrono, log, sigpolicy_tuf, tokio_util, tough};
}
