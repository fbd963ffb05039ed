//! Artifact signature checks for message signatures and DSSE envelopes.

use super::VerificationError;
use crate::bundle::{Content, DsseEnvelope};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::Deserialize;
use std::collections::BTreeMap;

const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// Digest of the artifact being verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDigest {
    /// Lowercase algorithm name as it appears in digest strings, e.g. "sha256".
    pub algorithm: String,
    pub value: Vec<u8>,
}

impl ArtifactDigest {
    pub fn hex(&self) -> String {
        hex::encode(&self.value)
    }
}

#[derive(Deserialize)]
struct Statement {
    #[serde(default)]
    subject: Vec<Subject>,
}

#[derive(Deserialize)]
struct Subject {
    #[serde(default)]
    digest: BTreeMap<String, String>,
}

/// Verify the bundle content with the signing key and bind it to `artifact`.
pub fn verify_content(
    content: &Content,
    key: &VerifyingKey,
    artifact: &ArtifactDigest,
) -> Result<(), VerificationError> {
    match content {
        Content::MessageSignature {
            digest_algorithm,
            digest,
            signature,
        } => {
            if artifact.algorithm != "sha256" {
                return Err(VerificationError::Signature(format!(
                    "message signatures over {} digests are not supported",
                    artifact.algorithm
                )));
            }
            if !digest.is_empty() {
                if digest_algorithm != "SHA2_256" {
                    return Err(VerificationError::Signature(format!(
                        "unexpected message digest algorithm {digest_algorithm}"
                    )));
                }
                if digest != &artifact.value {
                    return Err(VerificationError::Signature(
                        "message digest does not match the artifact digest".to_string(),
                    ));
                }
            }
            let signature = parse_signature(signature)?;
            key.verify_prehash(&artifact.value, &signature)
                .map_err(|e| VerificationError::Signature(format!("message signature: {e}")))
        }
        Content::Dsse(envelope) => {
            verify_envelope(envelope, key)?;
            check_subject(envelope, artifact)
        }
    }
}

fn verify_envelope(envelope: &DsseEnvelope, key: &VerifyingKey) -> Result<(), VerificationError> {
    if envelope.signatures.is_empty() {
        return Err(VerificationError::MissingSignature);
    }
    let pae = envelope.pae();
    let verified = envelope.signatures.iter().any(|sig| {
        parse_signature(&sig.sig)
            .map(|signature| key.verify(&pae, &signature).is_ok())
            .unwrap_or(false)
    });
    if !verified {
        return Err(VerificationError::Signature(
            "no envelope signature verifies with the signing certificate".to_string(),
        ));
    }
    Ok(())
}

fn check_subject(envelope: &DsseEnvelope, artifact: &ArtifactDigest) -> Result<(), VerificationError> {
    if envelope.payload_type != IN_TOTO_PAYLOAD_TYPE {
        return Err(VerificationError::Signature(format!(
            "unsupported envelope payload type {}",
            envelope.payload_type
        )));
    }
    let statement: Statement = serde_json::from_slice(&envelope.payload)
        .map_err(|e| VerificationError::Signature(format!("in-toto statement: {e}")))?;
    let expected = artifact.hex();
    let matched = statement.subject.iter().any(|s| {
        s.digest
            .get(&artifact.algorithm)
            .is_some_and(|d| d.eq_ignore_ascii_case(&expected))
    });
    if !matched {
        return Err(VerificationError::Signature(
            "no in-toto subject matches the artifact digest".to_string(),
        ));
    }
    Ok(())
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, VerificationError> {
    Signature::from_der(bytes)
        .or_else(|_| Signature::from_slice(bytes))
        .map_err(|e| VerificationError::Signature(format!("malformed signature: {e}")))
}
