//! Sigstore signature bundles.
//!
//! Bundles arrive as protobuf JSON: byte fields are base64 and 64-bit
//! integers are usually quoted. Versions 0.1 through 0.3 are accepted and the
//! per-version rules on transparency log proofs and certificate layout are
//! enforced while decoding, so later stages can rely on them.

use crate::error::PolicyError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer};

const MEDIA_TYPE_PREFIX: &str = "application/vnd.dev.sigstore.bundle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BundleVersion {
    V01,
    V02,
    V03,
}

impl BundleVersion {
    fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            "application/vnd.dev.sigstore.bundle+json;version=0.1" => Some(Self::V01),
            "application/vnd.dev.sigstore.bundle+json;version=0.2" => Some(Self::V02),
            "application/vnd.dev.sigstore.bundle+json;version=0.3"
            | "application/vnd.dev.sigstore.bundle.v0.3+json" => Some(Self::V03),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub media_type: String,
    pub version: BundleVersion,
    /// DER certificates, leaf first. Empty when the bundle only names a public key.
    pub certificates: Vec<Vec<u8>>,
    pub public_key_hint: Option<String>,
    pub tlog_entries: Vec<TlogEntry>,
    pub rfc3161_timestamps: Vec<Vec<u8>>,
    pub content: Option<Content>,
}

#[derive(Debug, Clone)]
pub struct TlogEntry {
    pub log_index: i64,
    pub log_id: Vec<u8>,
    pub kind: String,
    pub version: String,
    pub integrated_time: i64,
    /// Signed entry timestamp.
    pub inclusion_promise: Option<Vec<u8>>,
    pub inclusion_proof: Option<InclusionProof>,
    pub canonicalized_body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InclusionProof {
    pub log_index: i64,
    pub root_hash: Vec<u8>,
    pub tree_size: i64,
    pub hashes: Vec<Vec<u8>>,
    pub checkpoint: String,
}

#[derive(Debug, Clone)]
pub enum Content {
    MessageSignature {
        digest_algorithm: String,
        digest: Vec<u8>,
        signature: Vec<u8>,
    },
    Dsse(DsseEnvelope),
}

#[derive(Debug, Clone)]
pub struct DsseEnvelope {
    pub payload: Vec<u8>,
    pub payload_type: String,
    pub signatures: Vec<DsseSignature>,
}

#[derive(Debug, Clone)]
pub struct DsseSignature {
    pub sig: Vec<u8>,
    pub keyid: String,
}

impl DsseEnvelope {
    /// DSSE pre-authentication encoding, the bytes the envelope signatures cover.
    pub fn pae(&self) -> Vec<u8> {
        let mut out = format!(
            "DSSEv1 {} {} {} ",
            self.payload_type.len(),
            self.payload_type,
            self.payload.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.payload);
        out
    }
}

impl Bundle {
    pub fn from_json(bytes: &[u8]) -> Result<Self, PolicyError> {
        let raw: RawBundle =
            serde_json::from_slice(bytes).map_err(|e| invalid(format!("malformed JSON: {e}")))?;
        let version = BundleVersion::from_media_type(&raw.media_type).ok_or_else(|| {
            invalid(format!(
                "unsupported media type {:?} (expected {MEDIA_TYPE_PREFIX}...)",
                raw.media_type
            ))
        })?;
        let material = raw
            .verification_material
            .ok_or_else(|| invalid("missing verificationMaterial"))?;

        let certificates = match (material.certificate, material.x509_certificate_chain) {
            (Some(_), Some(_)) => return Err(invalid("both certificate and certificate chain set")),
            (Some(cert), None) => vec![decode(&cert.raw_bytes, "certificate")?],
            (None, Some(chain)) => {
                if version == BundleVersion::V03 {
                    return Err(invalid("v0.3 bundles must carry a single certificate"));
                }
                chain
                    .certificates
                    .iter()
                    .map(|c| decode(&c.raw_bytes, "certificate"))
                    .collect::<Result<Vec<_>, _>>()?
            }
            (None, None) => Vec::new(),
        };
        if certificates.iter().any(Vec::is_empty) {
            return Err(invalid("empty certificate"));
        }

        let tlog_entries = material
            .tlog_entries
            .into_iter()
            .map(|entry| convert_entry(entry, version))
            .collect::<Result<Vec<_>, _>>()?;

        let rfc3161_timestamps = material
            .timestamp_verification_data
            .map(|d| d.rfc3161_timestamps)
            .unwrap_or_default()
            .iter()
            .map(|t| decode(&t.signed_timestamp, "rfc3161 timestamp"))
            .collect::<Result<Vec<_>, _>>()?;

        let content = match (raw.message_signature, raw.dsse_envelope) {
            (Some(_), Some(_)) => return Err(invalid("both messageSignature and dsseEnvelope set")),
            (Some(ms), None) => {
                let (digest_algorithm, digest) = match ms.message_digest {
                    Some(d) => (d.algorithm, decode(&d.digest, "message digest")?),
                    None => (String::new(), Vec::new()),
                };
                Some(Content::MessageSignature {
                    digest_algorithm,
                    digest,
                    signature: decode(&ms.signature, "signature")?,
                })
            }
            (None, Some(env)) => Some(Content::Dsse(DsseEnvelope {
                payload: decode(&env.payload, "DSSE payload")?,
                payload_type: env.payload_type,
                signatures: env
                    .signatures
                    .iter()
                    .map(|s| {
                        Ok(DsseSignature {
                            sig: decode(&s.sig, "DSSE signature")?,
                            keyid: s.keyid.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, PolicyError>>()?,
            })),
            (None, None) => None,
        };

        Ok(Bundle {
            media_type: raw.media_type,
            version,
            certificates,
            public_key_hint: material.public_key.map(|k| k.hint),
            tlog_entries,
            rfc3161_timestamps,
            content,
        })
    }

    pub fn leaf_certificate(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }
}

fn convert_entry(raw: RawTlogEntry, version: BundleVersion) -> Result<TlogEntry, PolicyError> {
    let kind_version = raw
        .kind_version
        .ok_or_else(|| invalid("tlog entry without kindVersion"))?;
    let log_id = raw.log_id.ok_or_else(|| invalid("tlog entry without logId"))?;

    let inclusion_promise = raw
        .inclusion_promise
        .map(|p| decode(&p.signed_entry_timestamp, "signed entry timestamp"))
        .transpose()?;
    let inclusion_proof = raw
        .inclusion_proof
        .map(|p| -> Result<InclusionProof, PolicyError> {
            Ok(InclusionProof {
                log_index: p.log_index,
                root_hash: decode(&p.root_hash, "root hash")?,
                tree_size: p.tree_size,
                hashes: p
                    .hashes
                    .iter()
                    .map(|h| decode(h, "proof hash"))
                    .collect::<Result<Vec<_>, _>>()?,
                checkpoint: p.checkpoint.map(|c| c.envelope).unwrap_or_default(),
            })
        })
        .transpose()?;

    match version {
        BundleVersion::V01 if inclusion_promise.is_none() => {
            return Err(invalid("v0.1 bundle tlog entry lacks an inclusion promise"));
        }
        BundleVersion::V02 | BundleVersion::V03 => match &inclusion_proof {
            None => return Err(invalid("tlog entry lacks an inclusion proof")),
            Some(proof) if proof.checkpoint.is_empty() => {
                return Err(invalid("inclusion proof lacks a checkpoint"));
            }
            Some(_) => {}
        },
        _ => {}
    }

    Ok(TlogEntry {
        log_index: raw.log_index,
        log_id: decode(&log_id.key_id, "log id")?,
        kind: kind_version.kind,
        version: kind_version.version,
        integrated_time: raw.integrated_time,
        inclusion_promise,
        inclusion_proof,
        canonicalized_body: decode(&raw.canonicalized_body, "canonicalized body")?,
    })
}

fn invalid(reason: impl Into<String>) -> PolicyError {
    PolicyError::InvalidBundle(reason.into())
}

fn decode(value: &str, what: &str) -> Result<Vec<u8>, PolicyError> {
    BASE64
        .decode(value)
        .map_err(|e| invalid(format!("{what}: invalid base64: {e}")))
}

/// Protobuf JSON allows 64-bit integers as strings or numbers.
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }
    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundle {
    #[serde(default)]
    media_type: String,
    verification_material: Option<RawMaterial>,
    message_signature: Option<RawMessageSignature>,
    dsse_envelope: Option<RawEnvelope>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMaterial {
    certificate: Option<RawCert>,
    x509_certificate_chain: Option<RawChain>,
    public_key: Option<RawKeyHint>,
    #[serde(default)]
    tlog_entries: Vec<RawTlogEntry>,
    timestamp_verification_data: Option<RawTimestampData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCert {
    raw_bytes: String,
}

#[derive(Deserialize)]
struct RawChain {
    #[serde(default)]
    certificates: Vec<RawCert>,
}

#[derive(Deserialize)]
struct RawKeyHint {
    #[serde(default)]
    hint: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTimestampData {
    #[serde(default)]
    rfc3161_timestamps: Vec<RawSignedTimestamp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignedTimestamp {
    signed_timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTlogEntry {
    #[serde(deserialize_with = "int64", default)]
    log_index: i64,
    log_id: Option<RawLogId>,
    kind_version: Option<RawKindVersion>,
    #[serde(deserialize_with = "int64", default)]
    integrated_time: i64,
    inclusion_promise: Option<RawPromise>,
    inclusion_proof: Option<RawProof>,
    #[serde(default)]
    canonicalized_body: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogId {
    key_id: String,
}

#[derive(Deserialize)]
struct RawKindVersion {
    kind: String,
    version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPromise {
    signed_entry_timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProof {
    #[serde(deserialize_with = "int64", default)]
    log_index: i64,
    root_hash: String,
    #[serde(deserialize_with = "int64", default)]
    tree_size: i64,
    #[serde(default)]
    hashes: Vec<String>,
    checkpoint: Option<RawCheckpoint>,
}

#[derive(Deserialize)]
struct RawCheckpoint {
    envelope: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageSignature {
    message_digest: Option<RawDigest>,
    signature: String,
}

#[derive(Deserialize)]
struct RawDigest {
    algorithm: String,
    digest: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    payload: String,
    payload_type: String,
    #[serde(default)]
    signatures: Vec<RawDsseSignature>,
}

#[derive(Deserialize)]
struct RawDsseSignature {
    sig: String,
    #[serde(default)]
    keyid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const V03: &[u8] = include_bytes!("../../tests/fixtures/bundle-v03.json");
    const V03_DSSE: &[u8] = include_bytes!("../../tests/fixtures/bundle-v03-dsse.json");
    const V01: &[u8] = include_bytes!("../../tests/fixtures/bundle-v01.json");

    fn edit(bytes: &[u8], f: impl FnOnce(&mut serde_json::Value)) -> Vec<u8> {
        let mut value: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        f(&mut value);
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_parse_v03_message_signature() {
        let bundle = Bundle::from_json(V03).unwrap();
        assert_eq!(bundle.version, BundleVersion::V03);
        assert_eq!(bundle.certificates.len(), 1);
        assert_eq!(bundle.tlog_entries.len(), 1);
        let entry = &bundle.tlog_entries[0];
        assert_eq!(entry.kind, "hashedrekord");
        assert_eq!(entry.integrated_time, 1740830400);
        assert_eq!(entry.log_index, 100005);
        let proof = entry.inclusion_proof.as_ref().unwrap();
        assert_eq!(proof.log_index, 5);
        assert_eq!(proof.tree_size, 7);
        assert!(proof.checkpoint.starts_with("rekor.sigpolicy.test"));
        assert!(matches!(
            bundle.content,
            Some(Content::MessageSignature { ref digest_algorithm, .. }) if digest_algorithm == "SHA2_256"
        ));
    }

    #[test]
    fn test_parse_v03_dsse() {
        let bundle = Bundle::from_json(V03_DSSE).unwrap();
        let Some(Content::Dsse(envelope)) = &bundle.content else {
            panic!("expected a DSSE envelope");
        };
        assert_eq!(envelope.payload_type, "application/vnd.in-toto+json");
        assert!(envelope.pae().starts_with(b"DSSEv1 28 application/vnd.in-toto+json "));
    }

    #[test]
    fn test_parse_v01_chain() {
        let bundle = Bundle::from_json(V01).unwrap();
        assert_eq!(bundle.version, BundleVersion::V01);
        assert_eq!(bundle.certificates.len(), 2);
        assert!(bundle.tlog_entries[0].inclusion_proof.is_none());
        assert!(bundle.tlog_entries[0].inclusion_promise.is_some());
    }

    #[test]
    fn test_integers_as_numbers() {
        let bytes = edit(V03, |v| {
            v["verificationMaterial"]["tlogEntries"][0]["integratedTime"] = 1740830400.into();
        });
        let bundle = Bundle::from_json(&bytes).unwrap();
        assert_eq!(bundle.tlog_entries[0].integrated_time, 1740830400);
    }

    #[test]
    fn test_version_rules() {
        let no_promise = edit(V01, |v| {
            v["verificationMaterial"]["tlogEntries"][0]
                .as_object_mut()
                .unwrap()
                .remove("inclusionPromise");
        });
        assert!(matches!(
            Bundle::from_json(&no_promise),
            Err(PolicyError::InvalidBundle(_))
        ));

        let no_proof = edit(V03, |v| {
            v["verificationMaterial"]["tlogEntries"][0]
                .as_object_mut()
                .unwrap()
                .remove("inclusionProof");
        });
        assert!(Bundle::from_json(&no_proof).is_err());

        let v03_with_chain = edit(V01, |v| {
            v["mediaType"] = "application/vnd.dev.sigstore.bundle.v0.3+json".into();
        });
        assert!(Bundle::from_json(&v03_with_chain).is_err());
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(matches!(
            Bundle::from_json(b"{not json"),
            Err(PolicyError::InvalidBundle(_))
        ));
        let bad_media = edit(V03, |v| v["mediaType"] = "application/json".into());
        assert!(Bundle::from_json(&bad_media).is_err());
        let bad_b64 = edit(V03, |v| {
            v["verificationMaterial"]["certificate"]["rawBytes"] = "***".into();
        });
        assert!(Bundle::from_json(&bad_b64).is_err());
    }

    #[test]
    fn test_missing_content_is_not_a_decoding_error() {
        let bytes = edit(V03, |v| {
            v.as_object_mut().unwrap().remove("messageSignature");
        });
        let bundle = Bundle::from_json(&bytes).unwrap();
        assert!(bundle.content.is_none());
    }
}
