//! Result types reported to callers.

mod classify;

pub use classify::{
    BUILDER_PREFIX, BUILDER_PREFIX_EXPERIMENTAL, GITHUB_ACTIONS_ISSUER, GITHUB_USER_ISSUER,
    GOOGLE_USER_ISSUER, SIGSTORE_INTERMEDIATE_ISSUER,
};

use crate::verify::CertificateSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provenance category of a verified signature.
///
/// Kept as a raw integer so that values read back from storage never fail to
/// decode; unknown values display as "Invalid".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub i32);

impl Kind {
    pub const DOCKER_GITHUB_BUILDER: Kind = Kind(1);
    pub const DOCKER_HARDENED_IMAGE: Kind = Kind(2);
    pub const SELF_SIGNED_GITHUB_REPO: Kind = Kind(3);
    pub const SELF_SIGNED: Kind = Kind(4);
    pub const UNTRUSTED: Kind = Kind(1000);
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match *self {
            Kind::DOCKER_GITHUB_BUILDER => "Docker GitHub Builder",
            Kind::DOCKER_HARDENED_IMAGE => "Docker Hardened Image",
            Kind::SELF_SIGNED_GITHUB_REPO => "GitHub Self-Signed",
            Kind::SELF_SIGNED => "Self-Signed",
            Kind::UNTRUSTED => "Untrusted",
            _ => "Invalid",
        };
        f.write_str(label)
    }
}

/// Envelope format the signature was found in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureType(pub i32);

impl SignatureType {
    pub const UNKNOWN: SignatureType = SignatureType(0);
    /// Sigstore bundle v0.3.
    pub const BUNDLE_V03: SignatureType = SignatureType(1);
    /// Simple signing payload recorded as a hashedrekord entry.
    pub const SIMPLE_SIGNING_V1: SignatureType = SignatureType(2);
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            SignatureType::BUNDLE_V03 => "Sigstore Bundle",
            SignatureType::SIMPLE_SIGNING_V1 => "Sigstore HashedRecord",
            _ => "Unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampVerificationResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    pub timestamp: DateTime<Utc>,
}

/// Freshness of the trust material a result was produced with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRootStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl TrustRootStatus {
    pub fn is_empty(&self) -> bool {
        self.error.is_none() && self.last_updated.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub kind: Kind,
    pub signature_type: SignatureType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<CertificateSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamps: Vec<TimestampVerificationResult>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_reference: String,
    #[serde(default, skip_serializing_if = "TrustRootStatus::is_empty")]
    pub trust_root_status: TrustRootStatus,
    #[serde(default, rename = "isDHI", skip_serializing_if = "std::ops::Not::not")]
    pub is_dhi: bool,
}

/// No signature, or no provenance attestation at all, exists for an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoSignatureChain {
    pub target: String,
    pub has_attestation: bool,
}

impl fmt::Display for NoSignatureChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_attestation {
            write!(f, "no signature found for image {}", self.target)
        } else {
            write!(f, "no provenance attestation found for image {}", self.target)
        }
    }
}

impl std::error::Error for NoSignatureChain {}
