//! Embedded signed certificate timestamps (RFC 6962 section 3.2).
//!
//! The CT log signed the precertificate, so the signed data is rebuilt from
//! the final certificate's TBS with the SCT list extension removed.

use super::certificate::{der_contents, LeafCertificate};
use super::VerificationError;
use crate::trust::TrustedRoot;
use chrono::{TimeZone, Utc};
use p256::ecdsa::{signature::Verifier, Signature};
use sha2::{Digest, Sha256};
use x509_cert::der::{oid::ObjectIdentifier, Decode, Encode};
use x509_parser::prelude::*;

const SCT_LIST_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.4.2");

/// One parsed SCT (version 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificateTimestamp {
    pub log_id: [u8; 32],
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    pub extensions: Vec<u8>,
    pub hash_algorithm: u8,
    pub signature_algorithm: u8,
    pub signature: Vec<u8>,
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], VerificationError> {
        if self.data.len() < n {
            return Err(VerificationError::Sct("truncated SCT list".to_string()));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn uint(&mut self, n: usize) -> Result<u64, VerificationError> {
        Ok(self
            .take(n)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    fn vector(&mut self, len_bytes: usize) -> Result<&'a [u8], VerificationError> {
        let len = self.uint(len_bytes)? as usize;
        self.take(len)
    }
}

/// Parse the value of the SCT list extension: a DER OCTET STRING wrapping a
/// TLS `SignedCertificateTimestampList`.
pub fn parse_sct_list(extension_value: &[u8]) -> Result<Vec<SignedCertificateTimestamp>, VerificationError> {
    let list = der_contents(extension_value, &[0x04])
        .ok_or_else(|| VerificationError::Sct("SCT extension is not an octet string".to_string()))?;

    let mut outer = Reader { data: list };
    let mut entries = Reader {
        data: outer.vector(2)?,
    };
    let mut scts = Vec::new();
    while !entries.data.is_empty() {
        let mut sct = Reader {
            data: entries.vector(2)?,
        };
        let version = sct.uint(1)?;
        if version != 0 {
            log::debug!("skipping SCT with unknown version {version}");
            continue;
        }
        let mut log_id = [0u8; 32];
        log_id.copy_from_slice(sct.take(32)?);
        scts.push(SignedCertificateTimestamp {
            log_id,
            timestamp: sct.uint(8)?,
            extensions: sct.vector(2)?.to_vec(),
            hash_algorithm: sct.uint(1)? as u8,
            signature_algorithm: sct.uint(1)? as u8,
            signature: sct.vector(2)?.to_vec(),
        });
    }
    Ok(scts)
}

/// TBS of the precertificate the log saw.
fn precertificate_tbs(leaf_der: &[u8]) -> Result<Vec<u8>, VerificationError> {
    let mut cert = x509_cert::Certificate::from_der(leaf_der)
        .map_err(|e| VerificationError::Sct(format!("failed to decode certificate: {e}")))?;
    if let Some(extensions) = cert.tbs_certificate.extensions.as_mut() {
        extensions.retain(|ext| ext.extn_id != SCT_LIST_OID);
    }
    cert.tbs_certificate
        .to_der()
        .map_err(|e| VerificationError::Sct(format!("failed to re-encode TBS: {e}")))
}

/// Hash of the issuing CA's public key, located among the trusted CAs by subject.
fn issuer_key_hash(
    leaf: &LeafCertificate,
    trusted_root: &TrustedRoot,
) -> Result<[u8; 32], VerificationError> {
    for ca in &trusted_root.certificate_authorities {
        for der in &ca.certificates {
            let Ok((_, cert)) = X509Certificate::from_der(der) else {
                continue;
            };
            if cert.subject().as_raw() == leaf.issuer_der.as_slice() {
                return Ok(Sha256::digest(cert.public_key().raw).into());
            }
        }
    }
    Err(VerificationError::Sct(
        "issuer of the signing certificate is not a trusted CA".to_string(),
    ))
}

fn signed_data(sct: &SignedCertificateTimestamp, issuer_key_hash: &[u8; 32], tbs: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tbs.len() + 64);
    out.push(0); // sct_version v1
    out.push(0); // signature_type certificate_timestamp
    out.extend_from_slice(&sct.timestamp.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // precert_entry
    out.extend_from_slice(issuer_key_hash);
    out.extend_from_slice(&(tbs.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(tbs);
    out.extend_from_slice(&(sct.extensions.len() as u16).to_be_bytes());
    out.extend_from_slice(&sct.extensions);
    out
}

/// Count the embedded SCTs that verify against a trusted CT log.
pub fn verify_embedded_scts(
    leaf: &LeafCertificate,
    trusted_root: &TrustedRoot,
) -> Result<usize, VerificationError> {
    let Some(list) = &leaf.sct_list else {
        return Ok(0);
    };
    let scts = parse_sct_list(list)?;
    if scts.is_empty() {
        return Ok(0);
    }
    let tbs = precertificate_tbs(&leaf.der)?;
    let key_hash = issuer_key_hash(leaf, trusted_root)?;

    let mut verified = 0;
    for sct in &scts {
        let Some(log) = trusted_root.ctlog(&sct.log_id) else {
            log::debug!("SCT from unknown CT log {}", hex::encode(sct.log_id));
            continue;
        };
        let at = Utc.timestamp_millis_opt(sct.timestamp as i64).single();
        if !at.is_some_and(|at| log.valid_for.contains(at)) {
            log::debug!("SCT timestamp outside the validity of CT log {}", log.base_url);
            continue;
        }
        let Some(key) = &log.key else {
            log::debug!("CT log {} has no usable key", log.base_url);
            continue;
        };
        let Ok(signature) = Signature::from_der(&sct.signature) else {
            log::debug!("malformed SCT signature from {}", log.base_url);
            continue;
        };
        match key.verify(&signed_data(sct, &key_hash, &tbs), &signature) {
            Ok(()) => verified += 1,
            Err(e) => log::debug!("SCT from {} did not verify: {e}", log.base_url),
        }
    }
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn fixture_leaf() -> LeafCertificate {
        let bundle: serde_json::Value =
            serde_json::from_slice(include_bytes!("../../tests/fixtures/bundle-v03.json")).unwrap();
        let raw = bundle["verificationMaterial"]["certificate"]["rawBytes"]
            .as_str()
            .unwrap();
        LeafCertificate::parse(&BASE64.decode(raw).unwrap()).unwrap()
    }

    fn test_root() -> TrustedRoot {
        TrustedRoot::from_json(include_bytes!("../../tests/fixtures/trusted_root.json")).unwrap()
    }

    #[test]
    fn test_parse_embedded_list() {
        let leaf = fixture_leaf();
        let scts = parse_sct_list(leaf.sct_list.as_ref().unwrap()).unwrap();
        assert_eq!(scts.len(), 1);
        assert_eq!(scts[0].timestamp, (1740830400 - 30) * 1000);
        assert_eq!(scts[0].hash_algorithm, 4);
        assert_eq!(scts[0].signature_algorithm, 3);
        assert_eq!(scts[0].log_id.to_vec(), test_root().ctlogs[0].log_id);
    }

    #[test]
    fn test_verify_against_test_root() {
        assert_eq!(verify_embedded_scts(&fixture_leaf(), &test_root()).unwrap(), 1);
    }

    #[test]
    fn test_unknown_log_is_not_counted() {
        let mut root = test_root();
        root.ctlogs.clear();
        assert_eq!(verify_embedded_scts(&fixture_leaf(), &root).unwrap(), 0);
    }

    #[test]
    fn test_untrusted_issuer() {
        let root = TrustedRoot::from_json(include_bytes!(
            "../../tests/fixtures/sigstore_trusted_root.json"
        ))
        .unwrap();
        assert!(matches!(
            verify_embedded_scts(&fixture_leaf(), &root),
            Err(VerificationError::Sct(_))
        ));
    }

    #[test]
    fn test_truncated_list() {
        assert!(parse_sct_list(&[0x04, 0x03, 0x00, 0x05, 0x00]).is_err());
    }
}
