//! Certificate path validation for Fulcio signing certificates.
//!
//! Uses rustls-webpki to check that the leaf chains up to a trusted CA, that
//! every certificate was valid at the observed signing time, and that the
//! code-signing EKU is present.

use super::VerificationError;
use crate::trust::{CertificateAuthority, TrustedRoot};
use chrono::{DateTime, Utc};
use rustls_pki_types::{CertificateDer, UnixTime};
use std::time::Duration;
use webpki::{EndEntityCert, KeyUsage};

/// id-kp-codeSigning (1.3.6.1.5.5.7.3.3)
const EKU_CODE_SIGNING: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x03];

/// Validate `leaf_der` at `at` against the CAs valid at that time.
///
/// `extra_intermediates` are chain certificates shipped inside the bundle
/// (v0.1 and v0.2 bundles); they can only help build a path, never anchor it.
pub fn verify_chain_at(
    leaf_der: &[u8],
    extra_intermediates: &[Vec<u8>],
    trusted_root: &TrustedRoot,
    at: DateTime<Utc>,
) -> Result<(), VerificationError> {
    let time = unix_time(at)?;

    let leaf = CertificateDer::from(leaf_der);
    let cert = EndEntityCert::try_from(&leaf)
        .map_err(|e| VerificationError::Chain(format!("failed to parse certificate: {e:?}")))?;

    let candidates: Vec<&CertificateAuthority> = trusted_root
        .certificate_authorities
        .iter()
        .filter(|ca| ca.valid_for.contains(at))
        .collect();
    if candidates.is_empty() {
        return Err(VerificationError::Chain(format!(
            "no certificate authority was valid at {at}"
        )));
    }

    let mut last_error = None;
    for ca in candidates {
        let Some(root) = ca.root() else { continue };
        let root = CertificateDer::from(root);
        let anchor = match webpki::anchor_from_trusted_cert(&root) {
            Ok(anchor) => anchor,
            Err(e) => {
                log::warn!("unusable trust anchor for {}: {e:?}", ca.uri);
                continue;
            }
        };
        let intermediates: Vec<CertificateDer<'_>> = ca
            .intermediates()
            .iter()
            .chain(extra_intermediates)
            .map(|der| CertificateDer::from(der.as_slice()))
            .collect();

        match cert.verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &[anchor],
            &intermediates,
            time,
            KeyUsage::required(EKU_CODE_SIGNING),
            None,
            None,
        ) {
            Ok(_) => {
                log::debug!("certificate chains to {} at {at}", ca.uri);
                return Ok(());
            }
            Err(e) => last_error = Some(format!("{}: {e:?}", ca.uri)),
        }
    }
    Err(VerificationError::Chain(
        last_error.unwrap_or_else(|| "no usable certificate authority".to_string()),
    ))
}

pub(crate) fn unix_time(at: DateTime<Utc>) -> Result<UnixTime, VerificationError> {
    let seconds = u64::try_from(at.timestamp())
        .map_err(|_| VerificationError::Chain(format!("time {at} predates the epoch")))?;
    Ok(UnixTime::since_unix_epoch(Duration::from_secs(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use chrono::TimeZone;

    const SIGNED_AT: i64 = 1740830400;

    fn fixture() -> (Bundle, TrustedRoot) {
        let bundle =
            Bundle::from_json(include_bytes!("../../tests/fixtures/bundle-v03.json")).unwrap();
        let root =
            TrustedRoot::from_json(include_bytes!("../../tests/fixtures/trusted_root.json")).unwrap();
        (bundle, root)
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[test]
    fn test_chain_valid_at_signing_time() {
        let (bundle, root) = fixture();
        verify_chain_at(bundle.leaf_certificate().unwrap(), &[], &root, at(SIGNED_AT)).unwrap();
    }

    #[test]
    fn test_chain_outside_leaf_validity() {
        let (bundle, root) = fixture();
        let leaf = bundle.leaf_certificate().unwrap();
        assert!(verify_chain_at(leaf, &[], &root, at(SIGNED_AT + 3600)).is_err());
        assert!(verify_chain_at(leaf, &[], &root, at(SIGNED_AT - 3600)).is_err());
    }

    #[test]
    fn test_chain_requires_valid_ca_window() {
        let (bundle, mut root) = fixture();
        root.certificate_authorities[0].valid_for.end = Some(at(SIGNED_AT - 1));
        let err = verify_chain_at(bundle.leaf_certificate().unwrap(), &[], &root, at(SIGNED_AT))
            .unwrap_err();
        assert!(err.to_string().contains("no certificate authority"));
    }

    #[test]
    fn test_chain_untrusted_root() {
        let (bundle, _) = fixture();
        let public_good = TrustedRoot::from_json(include_bytes!(
            "../../tests/fixtures/sigstore_trusted_root.json"
        ))
        .unwrap();
        assert!(verify_chain_at(
            bundle.leaf_certificate().unwrap(),
            &[],
            &public_good,
            at(SIGNED_AT)
        )
        .is_err());
    }
}
