//! The Sigstore trusted root document.
//!
//! `trusted_root.json` is distributed as a TUF target and lists the
//! certificate authorities, transparency logs, certificate transparency logs
//! and timestamp authorities a verifier may rely on, each with a validity
//! window. Keys are decoded once here so verification never re-parses them.

use crate::error::PolicyError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use p256::ecdsa::VerifyingKey;
use p256::pkcs8::DecodePublicKey;
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub const TRUSTED_ROOT_MEDIA_TYPE_PREFIX: &str = "application/vnd.dev.sigstore.trustedroot";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrustedRoot {
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    tlogs: Vec<RawLog>,
    #[serde(default)]
    certificate_authorities: Vec<RawAuthority>,
    #[serde(default)]
    ctlogs: Vec<RawLog>,
    #[serde(default)]
    timestamp_authorities: Vec<RawAuthority>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    hash_algorithm: String,
    public_key: RawPublicKey,
    #[serde(default)]
    log_id: Option<RawLogId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPublicKey {
    #[serde(default)]
    raw_bytes: String,
    #[serde(default)]
    key_details: String,
    #[serde(default)]
    valid_for: Option<RawValidity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogId {
    key_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAuthority {
    #[serde(default)]
    subject: RawSubject,
    #[serde(default)]
    uri: String,
    cert_chain: RawCertChain,
    #[serde(default)]
    valid_for: Option<RawValidity>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubject {
    #[serde(default)]
    organization: String,
    #[serde(default)]
    common_name: String,
}

#[derive(Debug, Deserialize)]
struct RawCertChain {
    certificates: Vec<RawCertificate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertificate {
    raw_bytes: String,
}

#[derive(Debug, Deserialize)]
struct RawValidity {
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
}

/// A half-open-ended validity window; a missing bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidityPeriod {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ValidityPeriod {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| at >= start) && self.end.map_or(true, |end| at <= end)
    }
}

fn validity(raw: Option<RawValidity>) -> ValidityPeriod {
    raw.map(|v| ValidityPeriod {
        start: v.start,
        end: v.end,
    })
    .unwrap_or_default()
}

/// A transparency log or certificate transparency log.
#[derive(Debug, Clone)]
pub struct TransparencyLog {
    pub base_url: String,
    pub hash_algorithm: String,
    pub key_details: String,
    /// SubjectPublicKeyInfo DER.
    pub key_der: Vec<u8>,
    /// Decoded key when the log signs with ECDSA P-256.
    pub key: Option<VerifyingKey>,
    pub log_id: Vec<u8>,
    pub valid_for: ValidityPeriod,
}

#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    pub uri: String,
    pub organization: String,
    pub common_name: String,
    /// DER certificates, issuing certificate first and self-signed root last.
    pub certificates: Vec<Vec<u8>>,
    pub valid_for: ValidityPeriod,
}

impl CertificateAuthority {
    pub fn root(&self) -> Option<&[u8]> {
        self.certificates.last().map(Vec::as_slice)
    }

    pub fn intermediates(&self) -> &[Vec<u8>] {
        match self.certificates.len() {
            0 => &[],
            n => &self.certificates[..n - 1],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrustedRoot {
    pub media_type: String,
    pub tlogs: Vec<TransparencyLog>,
    pub certificate_authorities: Vec<CertificateAuthority>,
    pub ctlogs: Vec<TransparencyLog>,
    pub timestamp_authorities: Vec<CertificateAuthority>,
}

impl TrustedRoot {
    pub fn from_json(bytes: &[u8]) -> Result<Self, PolicyError> {
        let raw: RawTrustedRoot = serde_json::from_slice(bytes)
            .map_err(|e| PolicyError::TrustMaterialMalformed(format!("trusted root: {e}")))?;
        if !raw.media_type.is_empty() && !raw.media_type.starts_with(TRUSTED_ROOT_MEDIA_TYPE_PREFIX)
        {
            return Err(PolicyError::TrustMaterialMalformed(format!(
                "unexpected trusted root media type {}",
                raw.media_type
            )));
        }

        let root = TrustedRoot {
            media_type: raw.media_type,
            tlogs: convert_logs(raw.tlogs, "tlog")?,
            certificate_authorities: convert_authorities(raw.certificate_authorities)?,
            ctlogs: convert_logs(raw.ctlogs, "ctlog")?,
            timestamp_authorities: convert_authorities(raw.timestamp_authorities)?,
        };
        if root.certificate_authorities.is_empty() {
            return Err(PolicyError::TrustMaterialMalformed(
                "trusted root lists no certificate authorities".to_string(),
            ));
        }
        log::debug!(
            "trusted root: {} tlogs, {} CAs, {} ctlogs, {} TSAs",
            root.tlogs.len(),
            root.certificate_authorities.len(),
            root.ctlogs.len(),
            root.timestamp_authorities.len()
        );
        Ok(root)
    }

    pub fn tlog(&self, log_id: &[u8]) -> Option<&TransparencyLog> {
        self.tlogs.iter().find(|l| l.log_id == log_id)
    }

    pub fn ctlog(&self, log_id: &[u8]) -> Option<&TransparencyLog> {
        self.ctlogs.iter().find(|l| l.log_id == log_id)
    }
}

fn convert_logs(raw: Vec<RawLog>, what: &str) -> Result<Vec<TransparencyLog>, PolicyError> {
    raw.into_iter()
        .map(|log| {
            let key_der = decode(&log.public_key.raw_bytes, what)?;
            let log_id = match log.log_id {
                Some(id) => decode(&id.key_id, what)?,
                None => Sha256::digest(&key_der).to_vec(),
            };
            let key = if log.public_key.key_details.contains("ECDSA_P256") {
                Some(VerifyingKey::from_public_key_der(&key_der).map_err(|e| {
                    PolicyError::TrustMaterialMalformed(format!(
                        "{what} {}: bad P-256 key: {e}",
                        log.base_url
                    ))
                })?)
            } else {
                log::debug!(
                    "{what} {}: key type {} is not usable for verification",
                    log.base_url,
                    log.public_key.key_details
                );
                None
            };
            Ok(TransparencyLog {
                base_url: log.base_url,
                hash_algorithm: log.hash_algorithm,
                key_details: log.public_key.key_details,
                key_der,
                key,
                log_id,
                valid_for: validity(log.public_key.valid_for),
            })
        })
        .collect()
}

fn convert_authorities(raw: Vec<RawAuthority>) -> Result<Vec<CertificateAuthority>, PolicyError> {
    raw.into_iter()
        .map(|ca| {
            let certificates = ca
                .cert_chain
                .certificates
                .iter()
                .map(|c| decode(&c.raw_bytes, "certificate"))
                .collect::<Result<Vec<_>, _>>()?;
            if certificates.is_empty() {
                return Err(PolicyError::TrustMaterialMalformed(format!(
                    "authority {} has an empty certificate chain",
                    ca.uri
                )));
            }
            Ok(CertificateAuthority {
                uri: ca.uri,
                organization: ca.subject.organization,
                common_name: ca.subject.common_name,
                certificates,
                valid_for: validity(ca.valid_for),
            })
        })
        .collect()
}

fn decode(value: &str, what: &str) -> Result<Vec<u8>, PolicyError> {
    BASE64
        .decode(value)
        .map_err(|e| PolicyError::TrustMaterialMalformed(format!("{what}: invalid base64: {e}")))
}
