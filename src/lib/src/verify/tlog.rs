//! Transparency log entry verification.
//!
//! Each entry is bound to the bundle by comparing its canonicalized body with
//! the bundle's signature, certificate and digest. Inclusion is then proven by
//! the signed entry timestamp (SET), by an RFC 6962 inclusion proof whose root
//! is covered by a signed checkpoint, or by both.

use super::merkle::{self, to_hash};
use super::VerificationError;
use crate::bundle::{Bundle, Content, InclusionProof, TlogEntry};
use crate::trust::{TransparencyLog, TrustedRoot};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, TimeZone, Utc};
use p256::ecdsa::{signature::Verifier, Signature};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A time at which a log attested to having seen the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverTimestamp {
    pub time: DateTime<Utc>,
    /// Base URL of the log that produced it.
    pub uri: String,
}

#[derive(Debug, Default)]
pub struct TlogOutcome {
    pub verified_entries: usize,
    pub timestamps: Vec<ObserverTimestamp>,
}

pub fn verify_entries(
    bundle: &Bundle,
    leaf_der: &[u8],
    trusted_root: &TrustedRoot,
) -> Result<TlogOutcome, VerificationError> {
    let mut outcome = TlogOutcome::default();
    for entry in &bundle.tlog_entries {
        let log = trusted_root.tlog(&entry.log_id).ok_or_else(|| {
            tlog_error(format!(
                "entry {} comes from unknown log {}",
                entry.log_index,
                hex::encode(&entry.log_id)
            ))
        })?;

        check_body(entry, bundle.content.as_ref(), leaf_der)?;

        let mut verified = false;
        if let Some(promise) = &entry.inclusion_promise {
            verify_set(entry, promise, log)?;
            let time = Utc
                .timestamp_opt(entry.integrated_time, 0)
                .single()
                .ok_or_else(|| tlog_error(format!("bad integrated time {}", entry.integrated_time)))?;
            if !log.valid_for.contains(time) {
                return Err(tlog_error(format!(
                    "entry {} integrated at {time} outside the validity of log {}",
                    entry.log_index, log.base_url
                )));
            }
            outcome.timestamps.push(ObserverTimestamp {
                time,
                uri: log.base_url.clone(),
            });
            verified = true;
        }
        if let Some(proof) = &entry.inclusion_proof {
            verify_inclusion(entry, proof, log)?;
            verified = true;
        }
        if !verified {
            return Err(tlog_error(format!(
                "entry {} has neither an inclusion promise nor a proof",
                entry.log_index
            )));
        }
        log::debug!("tlog entry {} verified against {}", entry.log_index, log.base_url);
        outcome.verified_entries += 1;
    }
    Ok(outcome)
}

/// Verify the SET: the log's signature over the RFC 8785 canonical JSON of
/// the entry's body, integrated time, log id and index.
pub fn verify_set(
    entry: &TlogEntry,
    promise: &[u8],
    log: &TransparencyLog,
) -> Result<(), VerificationError> {
    let key = log
        .key
        .as_ref()
        .ok_or_else(|| VerificationError::UnsupportedKey(format!("log {}", log.base_url)))?;
    let signature = Signature::from_der(promise)
        .map_err(|e| tlog_error(format!("malformed signed entry timestamp: {e}")))?;

    let payload = serde_json::json!({
        "body": BASE64.encode(&entry.canonicalized_body),
        "integratedTime": entry.integrated_time,
        "logID": hex::encode(&entry.log_id),
        "logIndex": entry.log_index,
    });
    let canonical = serde_jcs::to_vec(&payload)
        .map_err(|e| tlog_error(format!("failed to canonicalize SET payload: {e}")))?;

    key.verify(&canonical, &signature).map_err(|e| {
        tlog_error(format!(
            "signed entry timestamp for entry {} did not verify: {e}",
            entry.log_index
        ))
    })
}

pub fn verify_inclusion(
    entry: &TlogEntry,
    proof: &InclusionProof,
    log: &TransparencyLog,
) -> Result<(), VerificationError> {
    if proof.log_index < 0 || proof.tree_size < 0 {
        return Err(tlog_error("negative index or tree size in inclusion proof"));
    }
    let root = to_hash(&proof.root_hash, "root hash")?;
    let hashes = proof
        .hashes
        .iter()
        .map(|h| to_hash(h, "proof hash"))
        .collect::<Result<Vec<_>, _>>()?;
    let leaf = merkle::compute_leaf_hash(&entry.canonicalized_body);
    merkle::verify_inclusion_proof(
        proof.log_index as u64,
        proof.tree_size as u64,
        &leaf,
        &hashes,
        &root,
    )?;

    let checkpoint = Checkpoint::parse(&proof.checkpoint)?;
    checkpoint.verify(log)?;
    if checkpoint.size != proof.tree_size as u64 || checkpoint.root_hash != root {
        return Err(tlog_error(format!(
            "checkpoint (size {}) does not commit to the proof's tree (size {})",
            checkpoint.size, proof.tree_size
        )));
    }
    Ok(())
}

/// A signed note carrying a log's tree head.
#[derive(Debug)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    pub root_hash: [u8; 32],
    body: String,
    signatures: Vec<NoteSignature>,
}

#[derive(Debug)]
struct NoteSignature {
    name: String,
    key_hint: [u8; 4],
    signature: Vec<u8>,
}

impl Checkpoint {
    pub fn parse(envelope: &str) -> Result<Self, VerificationError> {
        let split = envelope
            .find("\n\n")
            .ok_or_else(|| tlog_error("checkpoint has no signature block"))?;
        let body = &envelope[..split + 1];
        let mut lines = body.lines();
        let origin = lines.next().unwrap_or_default().to_string();
        let size = lines
            .next()
            .and_then(|l| l.parse::<u64>().ok())
            .ok_or_else(|| tlog_error("checkpoint has no tree size"))?;
        let root_hash = lines
            .next()
            .and_then(|l| BASE64.decode(l).ok())
            .ok_or_else(|| tlog_error("checkpoint has no root hash"))?;
        let root_hash = to_hash(&root_hash, "checkpoint root hash")?;
        if origin.is_empty() {
            return Err(tlog_error("checkpoint has no origin"));
        }

        let mut signatures = Vec::new();
        for line in envelope[split + 2..].lines().filter(|l| !l.is_empty()) {
            let Some(rest) = line.strip_prefix("\u{2014} ") else {
                return Err(tlog_error(format!("malformed checkpoint signature line {line:?}")));
            };
            let (name, encoded) = rest
                .rsplit_once(' ')
                .ok_or_else(|| tlog_error("checkpoint signature line has no signature"))?;
            let raw = BASE64
                .decode(encoded)
                .map_err(|e| tlog_error(format!("checkpoint signature: {e}")))?;
            if raw.len() < 5 {
                return Err(tlog_error("checkpoint signature is too short"));
            }
            let mut key_hint = [0u8; 4];
            key_hint.copy_from_slice(&raw[..4]);
            signatures.push(NoteSignature {
                name: name.to_string(),
                key_hint,
                signature: raw[4..].to_vec(),
            });
        }

        Ok(Checkpoint {
            origin,
            size,
            root_hash,
            body: body.to_string(),
            signatures,
        })
    }

    /// At least one signature must come from `log`, matched by key hint.
    pub fn verify(&self, log: &TransparencyLog) -> Result<(), VerificationError> {
        let key = log
            .key
            .as_ref()
            .ok_or_else(|| VerificationError::UnsupportedKey(format!("log {}", log.base_url)))?;
        let candidates = self
            .signatures
            .iter()
            .filter(|s| log.log_id.len() >= 4 && s.key_hint == log.log_id[..4]);
        for candidate in candidates {
            let Ok(signature) = Signature::from_der(&candidate.signature) else {
                continue;
            };
            if key.verify(self.body.as_bytes(), &signature).is_ok() {
                log::debug!("checkpoint {} signed by {}", self.origin, candidate.name);
                return Ok(());
            }
        }
        Err(tlog_error(format!(
            "no valid signature from {} on checkpoint {}",
            log.base_url, self.origin
        )))
    }
}

/// Compare the logged body with what the bundle claims.
fn check_body(
    entry: &TlogEntry,
    content: Option<&Content>,
    leaf_der: &[u8],
) -> Result<(), VerificationError> {
    let body: Value = serde_json::from_slice(&entry.canonicalized_body)
        .map_err(|e| tlog_error(format!("entry {} body is not JSON: {e}", entry.log_index)))?;
    let kind = body["kind"].as_str().unwrap_or_default();
    let api_version = body["apiVersion"].as_str().unwrap_or_default();
    if kind != entry.kind || api_version != entry.version {
        return Err(tlog_error(format!(
            "entry claims {}/{} but body is {kind}/{api_version}",
            entry.kind, entry.version
        )));
    }
    let spec = &body["spec"];

    match (kind, api_version, content) {
        (
            "hashedrekord",
            "0.0.1",
            Some(Content::MessageSignature {
                digest, signature, ..
            }),
        ) => {
            expect_eq(
                &decode_field(&spec["signature"]["content"])?,
                signature,
                "signature",
            )?;
            expect_pem_cert(&spec["signature"]["publicKey"]["content"], leaf_der)?;
            if !digest.is_empty() {
                let logged = spec["data"]["hash"]["value"].as_str().unwrap_or_default();
                if logged != hex::encode(digest) {
                    return Err(tlog_error("logged digest differs from the bundle digest"));
                }
            }
            Ok(())
        }
        ("dsse", "0.0.1", Some(Content::Dsse(envelope))) => {
            let payload_hash = spec["payloadHash"]["value"].as_str().unwrap_or_default();
            if payload_hash != hex::encode(Sha256::digest(&envelope.payload)) {
                return Err(tlog_error("logged payload hash differs from the envelope"));
            }
            let logged = spec["signatures"].as_array().cloned().unwrap_or_default();
            if logged.len() != envelope.signatures.len() {
                return Err(tlog_error("logged signature count differs from the envelope"));
            }
            for sig in &envelope.signatures {
                let found = logged.iter().any(|l| {
                    decode_field(&l["signature"]).is_ok_and(|s| s == sig.sig)
                        && expect_pem_cert(&l["verifier"], leaf_der).is_ok()
                });
                if !found {
                    return Err(tlog_error("envelope signature missing from the log entry"));
                }
            }
            Ok(())
        }
        ("intoto", "0.0.2", Some(Content::Dsse(envelope))) => {
            let content = &spec["content"];
            let payload_hash = content["payloadHash"]["value"].as_str().unwrap_or_default();
            if payload_hash != hex::encode(Sha256::digest(&envelope.payload)) {
                return Err(tlog_error("logged payload hash differs from the envelope"));
            }
            let logged = content["envelope"]["signatures"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            for sig in &envelope.signatures {
                let found = logged.iter().any(|l| {
                    // Signatures are stored base64 encoded a second time.
                    let stored = decode_field(&l["sig"]).ok();
                    let matches = stored.as_ref().is_some_and(|s| {
                        s == &sig.sig || BASE64.decode(s).is_ok_and(|inner| inner == sig.sig)
                    });
                    matches && expect_pem_cert(&l["publicKey"], leaf_der).is_ok()
                });
                if !found {
                    return Err(tlog_error("envelope signature missing from the log entry"));
                }
            }
            Ok(())
        }
        (_, _, None) => Err(VerificationError::MissingSignature),
        _ => Err(tlog_error(format!(
            "unsupported entry type {kind}/{api_version} for this bundle content"
        ))),
    }
}

fn decode_field(value: &Value) -> Result<Vec<u8>, VerificationError> {
    let text = value
        .as_str()
        .ok_or_else(|| tlog_error("expected a base64 string in the entry body"))?;
    BASE64
        .decode(text)
        .map_err(|e| tlog_error(format!("entry body field: {e}")))
}

fn expect_pem_cert(value: &Value, leaf_der: &[u8]) -> Result<(), VerificationError> {
    let pem_bytes = decode_field(value)?;
    let parsed = pem::parse(&pem_bytes)
        .map_err(|e| tlog_error(format!("logged certificate is not PEM: {e}")))?;
    expect_eq(parsed.contents(), leaf_der, "certificate")
}

fn expect_eq(logged: &[u8], bundle: &[u8], what: &str) -> Result<(), VerificationError> {
    if logged != bundle {
        return Err(tlog_error(format!("logged {what} differs from the bundle")));
    }
    Ok(())
}

fn tlog_error(reason: impl Into<String>) -> VerificationError {
    VerificationError::Tlog(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(name: &str) -> Bundle {
        let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
        Bundle::from_json(&std::fs::read(path).unwrap()).unwrap()
    }

    fn test_root() -> TrustedRoot {
        TrustedRoot::from_json(include_bytes!("../../tests/fixtures/trusted_root.json")).unwrap()
    }

    #[test]
    fn test_verify_v03_entry() {
        let bundle = bundle("bundle-v03.json");
        let outcome =
            verify_entries(&bundle, bundle.leaf_certificate().unwrap(), &test_root()).unwrap();
        assert_eq!(outcome.verified_entries, 1);
        assert_eq!(outcome.timestamps.len(), 1);
        assert_eq!(outcome.timestamps[0].time.timestamp(), 1740830400);
        assert_eq!(outcome.timestamps[0].uri, "https://rekor.sigpolicy.test");
    }

    #[test]
    fn test_verify_dsse_entry() {
        let bundle = bundle("bundle-v03-dsse.json");
        let outcome =
            verify_entries(&bundle, bundle.leaf_certificate().unwrap(), &test_root()).unwrap();
        assert_eq!(outcome.verified_entries, 1);
    }

    #[test]
    fn test_verify_v01_set_only() {
        let bundle = bundle("bundle-v01.json");
        let outcome =
            verify_entries(&bundle, bundle.leaf_certificate().unwrap(), &test_root()).unwrap();
        assert_eq!(outcome.verified_entries, 1);
        assert_eq!(outcome.timestamps.len(), 1);
    }

    #[test]
    fn test_tampered_set_fails() {
        let mut bundle = bundle("bundle-v03.json");
        bundle.tlog_entries[0].integrated_time += 1;
        let err = verify_entries(&bundle, bundle.leaf_certificate().unwrap(), &test_root())
            .unwrap_err();
        assert!(matches!(err, VerificationError::Tlog(_)));
    }

    #[test]
    fn test_tampered_proof_fails() {
        let mut bundle = bundle("bundle-v03.json");
        let entry = &mut bundle.tlog_entries[0];
        let proof = entry.inclusion_proof.as_mut().unwrap();
        proof.hashes[0][0] ^= 0xff;
        let entry = &bundle.tlog_entries[0];
        let root = test_root();
        assert!(verify_inclusion(entry, entry.inclusion_proof.as_ref().unwrap(), &root.tlogs[0]).is_err());
    }

    #[test]
    fn test_body_must_match_bundle() {
        let mut bundle = bundle("bundle-v03.json");
        if let Some(Content::MessageSignature { signature, .. }) = bundle.content.as_mut() {
            signature[10] ^= 0x01;
        }
        let err = verify_entries(&bundle, bundle.leaf_certificate().unwrap(), &test_root())
            .unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn test_unknown_log() {
        let bundle = bundle("bundle-v03.json");
        let root = TrustedRoot::from_json(include_bytes!(
            "../../tests/fixtures/sigstore_trusted_root.json"
        ))
        .unwrap();
        assert!(verify_entries(&bundle, bundle.leaf_certificate().unwrap(), &root).is_err());
    }

    #[test]
    fn test_checkpoint_parse_and_verify() {
        let bundle = bundle("bundle-v03.json");
        let proof = bundle.tlog_entries[0].inclusion_proof.as_ref().unwrap();
        let checkpoint = Checkpoint::parse(&proof.checkpoint).unwrap();
        assert_eq!(checkpoint.size, 7);
        assert!(checkpoint.origin.starts_with("rekor.sigpolicy.test"));
        checkpoint.verify(&test_root().tlogs[0]).unwrap();

        let tampered = proof.checkpoint.replacen("\n7\n", "\n8\n", 1);
        let checkpoint = Checkpoint::parse(&tampered).unwrap();
        assert!(checkpoint.verify(&test_root().tlogs[0]).is_err());
    }

    #[test]
    fn test_checkpoint_malformed() {
        assert!(Checkpoint::parse("origin\n7\n").is_err());
        assert!(Checkpoint::parse("origin\nseven\nAAAA\n\n\u{2014} x AAAAAA==\n").is_err());
        assert!(Checkpoint::parse("origin\n7\nAAAA\n\n- x AAAAAA==\n").is_err());
    }
}
