use crate::verify::VerificationError;
use std::sync::Arc;

/// The sigpolicy error type.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid digest {digest:?}: {reason}")]
    InvalidDigest { digest: String, reason: String },

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Trust root unavailable: {0}")]
    TrustUnavailable(#[source] Arc<PolicyError>),

    #[error("Verification failed: {0}")]
    VerificationFailed(#[from] VerificationError),

    #[error("No valid signatures found")]
    NoValidSignature,

    #[error("Trust root refresh failed: {}", source_chain(.0))]
    Refresh(#[source] Arc<tough::error::Error>),

    #[error("Trust root not yet available: {0}")]
    NotYetAvailable(String),

    #[error("Trust material malformed: {0}")]
    TrustMaterialMalformed(String),

    #[error("Cache error at {path}: {source}")]
    Cache {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: [{0}]")]
    Internal(String),
}

impl PolicyError {
    /// Short machine-readable name, used as `error_type` in audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyError::Configuration(_) => "configuration",
            PolicyError::InvalidDigest { .. } => "invalid_digest",
            PolicyError::InvalidBundle(_) => "invalid_bundle",
            PolicyError::TrustUnavailable(_) => "trust_unavailable",
            PolicyError::VerificationFailed(_) => "verification_failed",
            PolicyError::NoValidSignature => "no_valid_signature",
            PolicyError::Refresh(_) => "refresh",
            PolicyError::NotYetAvailable(_) => "not_yet_available",
            PolicyError::TrustMaterialMalformed(_) => "trust_material_malformed",
            PolicyError::Cache { .. } => "cache",
            PolicyError::Internal(_) => "internal",
        }
    }

    /// Whether the update client rejected metadata because it has expired.
    pub fn is_expired_metadata(&self) -> bool {
        match self {
            PolicyError::Refresh(e) => {
                matches!(**e, tough::error::Error::ExpiredMetadata { .. })
            }
            PolicyError::TrustUnavailable(inner) => inner.is_expired_metadata(),
            _ => false,
        }
    }
}

impl From<tough::error::Error> for PolicyError {
    fn from(err: tough::error::Error) -> Self {
        PolicyError::Refresh(Arc::new(err))
    }
}

/// `err` followed by those of its causes that it does not already mention.
fn source_chain(err: &tough::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = std::error::Error::source(cause);
    }
    message
}
