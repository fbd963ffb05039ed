//! RFC 3161 signed timestamps.
//!
//! A timestamp authority countersigns the bundle signature. A token whose
//! imprint covers that signature and whose CMS signature chains to a TSA in
//! the trusted root is an observer timestamp, just like a log's integrated
//! time. Tokens that do not verify are skipped rather than fatal; the
//! observer threshold decides whether enough remain.

use super::chain::unix_time;
use super::tlog::ObserverTimestamp;
use super::VerificationError;
use crate::bundle::{Bundle, Content};
use crate::trust::{CertificateAuthority, TrustedRoot};
use chrono::{DateTime, TimeZone, Utc};
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedAttributes, SignedData};
use der::asn1::{Any, ObjectIdentifier, OctetString};
use der::{Decode, Encode, Sequence, SliceReader};
use rustls_pki_types::{CertificateDer, SignatureVerificationAlgorithm};
use sha2::{Digest, Sha256, Sha384, Sha512};
use webpki::{EndEntityCert, KeyUsage};
use x509_tsp::TstInfo;

const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const ID_CT_TST_INFO: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");
const ID_CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const ID_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2");
const ID_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3");
const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

/// id-kp-timeStamping (1.3.6.1.5.5.7.3.8)
const EKU_TIME_STAMPING: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x08];

/// PKIStatus values up to grantedWithMods carry a token.
const GRANTED_WITH_MODS: u32 = 1;

/// TimeStampResp as stored in bundles. The status is only inspected for its
/// leading PKIStatus integer.
#[derive(Clone, Debug, Sequence)]
struct TimeStampResp {
    status: Any,
    time_stamp_token: Option<ContentInfo>,
}

/// Verify every RFC 3161 timestamp in `bundle` and return those that hold.
pub fn verify_signed_timestamps(bundle: &Bundle, trusted_root: &TrustedRoot) -> Vec<ObserverTimestamp> {
    if bundle.rfc3161_timestamps.is_empty() {
        return Vec::new();
    }
    let Some(signature) = countersigned_bytes(bundle.content.as_ref()) else {
        log::warn!("bundle has RFC 3161 timestamps but no signature for them to cover");
        return Vec::new();
    };

    let mut verified = Vec::new();
    for (index, token) in bundle.rfc3161_timestamps.iter().enumerate() {
        match verify_token(token, signature, trusted_root) {
            Ok(timestamp) => {
                log::debug!(
                    "RFC 3161 timestamp {index} from {} at {}",
                    timestamp.uri,
                    timestamp.time
                );
                verified.push(timestamp);
            }
            Err(e) => log::warn!("RFC 3161 timestamp {index} not counted: {e}"),
        }
    }
    verified
}

/// The bytes a TSA countersigns: the message signature, or the first DSSE
/// envelope signature.
fn countersigned_bytes(content: Option<&Content>) -> Option<&[u8]> {
    match content? {
        Content::MessageSignature { signature, .. } => Some(signature),
        Content::Dsse(envelope) => envelope.signatures.first().map(|s| s.sig.as_slice()),
    }
}

pub fn verify_token(
    response: &[u8],
    signature: &[u8],
    trusted_root: &TrustedRoot,
) -> Result<ObserverTimestamp, VerificationError> {
    let response = TimeStampResp::from_der(response).map_err(asn1_error)?;
    let status = pki_status(&response.status).map_err(asn1_error)?;
    if status > GRANTED_WITH_MODS {
        return Err(timestamp_error(format!("request was not granted (status {status})")));
    }
    let token = response
        .time_stamp_token
        .ok_or_else(|| timestamp_error("response carries no token"))?;
    if token.content_type != ID_SIGNED_DATA {
        return Err(timestamp_error(format!(
            "token content type {} is not signed data",
            token.content_type
        )));
    }
    let signed: SignedData = token.content.decode_as().map_err(asn1_error)?;

    let encapsulated = &signed.encap_content_info;
    if encapsulated.econtent_type != ID_CT_TST_INFO {
        return Err(timestamp_error(format!(
            "encapsulated content type {} is not TSTInfo",
            encapsulated.econtent_type
        )));
    }
    let tst_der: OctetString = encapsulated
        .econtent
        .as_ref()
        .ok_or_else(|| timestamp_error("token carries no TSTInfo"))?
        .decode_as()
        .map_err(asn1_error)?;
    let info = TstInfo::from_der(tst_der.as_bytes()).map_err(asn1_error)?;

    let imprint = &info.message_imprint;
    if digest(&imprint.hash_algorithm.oid, signature)? != imprint.hashed_message.as_bytes() {
        return Err(timestamp_error("message imprint does not cover the bundle signature"));
    }
    let time = generation_time(&info)?;

    let signer = match signed.signer_infos.0.as_slice() {
        [signer] => signer,
        signers => {
            return Err(timestamp_error(format!(
                "expected one signer, found {}",
                signers.len()
            )))
        }
    };
    let attributes = signer
        .signed_attrs
        .as_ref()
        .ok_or_else(|| timestamp_error("signer has no signed attributes"))?;
    let content_type: ObjectIdentifier = attribute(attributes, ID_CONTENT_TYPE)?
        .decode_as()
        .map_err(asn1_error)?;
    if content_type != ID_CT_TST_INFO {
        return Err(timestamp_error("signed content type attribute is not TSTInfo"));
    }
    let message_digest: OctetString = attribute(attributes, ID_MESSAGE_DIGEST)?
        .decode_as()
        .map_err(asn1_error)?;
    if digest(&signer.digest_alg.oid, tst_der.as_bytes())? != message_digest.as_bytes() {
        return Err(timestamp_error("message digest attribute does not match TSTInfo"));
    }

    // The signature covers the attributes encoded as a SET OF, not as [0].
    let signed_attributes = attributes.to_der().map_err(asn1_error)?;
    let algorithms = signature_algorithms(&signer.signature_algorithm.oid, &signer.digest_alg.oid)?;

    let mut last_error = None;
    for tsa in trusted_root
        .timestamp_authorities
        .iter()
        .filter(|tsa| tsa.valid_for.contains(time))
    {
        match verify_signer(
            tsa,
            &signed_attributes,
            signer.signature.as_bytes(),
            &algorithms,
            time,
        ) {
            Ok(()) => {
                return Ok(ObserverTimestamp {
                    time,
                    uri: tsa.uri.clone(),
                })
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        timestamp_error(format!("no timestamp authority was valid at {time}"))
    }))
}

/// Check the TSA certificate path at `at` and the CMS signature with its
/// leaf. Chains list the leaf first and the root last.
fn verify_signer(
    tsa: &CertificateAuthority,
    message: &[u8],
    signature: &[u8],
    algorithms: &[&'static dyn SignatureVerificationAlgorithm],
    at: DateTime<Utc>,
) -> Result<(), VerificationError> {
    let (leaf, rest) = match tsa.certificates.split_first() {
        Some((leaf, rest)) if !rest.is_empty() => (leaf, rest),
        _ => {
            return Err(timestamp_error(format!(
                "{}: chain needs a leaf and a root",
                tsa.uri
            )))
        }
    };
    let leaf = CertificateDer::from(leaf.as_slice());
    let cert = EndEntityCert::try_from(&leaf)
        .map_err(|e| timestamp_error(format!("{}: bad certificate: {e:?}", tsa.uri)))?;

    let root = CertificateDer::from(rest[rest.len() - 1].as_slice());
    let anchor = webpki::anchor_from_trusted_cert(&root)
        .map_err(|e| timestamp_error(format!("{}: unusable root: {e:?}", tsa.uri)))?;
    let intermediates: Vec<CertificateDer<'_>> = rest[..rest.len() - 1]
        .iter()
        .map(|der| CertificateDer::from(der.as_slice()))
        .collect();
    cert.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        &[anchor],
        &intermediates,
        unix_time(at)?,
        KeyUsage::required(EKU_TIME_STAMPING),
        None,
        None,
    )
    .map_err(|e| timestamp_error(format!("{}: {e:?}", tsa.uri)))?;

    if algorithms
        .iter()
        .any(|alg| cert.verify_signature(*alg, message, signature).is_ok())
    {
        Ok(())
    } else {
        Err(timestamp_error(format!(
            "signature does not verify with the certificate of {}",
            tsa.uri
        )))
    }
}

fn pki_status(status: &Any) -> der::Result<u32> {
    let mut reader = SliceReader::new(status.value())?;
    u32::decode(&mut reader)
}

fn attribute(attributes: &SignedAttributes, oid: ObjectIdentifier) -> Result<&Any, VerificationError> {
    attributes
        .iter()
        .find(|attr| attr.oid == oid)
        .and_then(|attr| attr.values.iter().next())
        .ok_or_else(|| timestamp_error(format!("missing signed attribute {oid}")))
}

fn generation_time(info: &TstInfo) -> Result<DateTime<Utc>, VerificationError> {
    let since_epoch = info.gen_time.to_unix_duration();
    i64::try_from(since_epoch.as_secs())
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, since_epoch.subsec_nanos()).single())
        .ok_or_else(|| timestamp_error("generation time out of range"))
}

fn digest(algorithm: &ObjectIdentifier, data: &[u8]) -> Result<Vec<u8>, VerificationError> {
    if *algorithm == ID_SHA256 {
        Ok(Sha256::digest(data).to_vec())
    } else if *algorithm == ID_SHA384 {
        Ok(Sha384::digest(data).to_vec())
    } else if *algorithm == ID_SHA512 {
        Ok(Sha512::digest(data).to_vec())
    } else {
        Err(timestamp_error(format!("unsupported hash algorithm {algorithm}")))
    }
}

/// ECDSA verifiers for the signer's algorithm. Some TSAs name only the key
/// type, in which case the digest algorithm picks the hash.
fn signature_algorithms(
    signature_alg: &ObjectIdentifier,
    digest_alg: &ObjectIdentifier,
) -> Result<Vec<&'static dyn SignatureVerificationAlgorithm>, VerificationError> {
    let hash = if *signature_alg == ECDSA_WITH_SHA256 {
        ID_SHA256
    } else if *signature_alg == ECDSA_WITH_SHA384 {
        ID_SHA384
    } else if *signature_alg == ID_EC_PUBLIC_KEY {
        *digest_alg
    } else {
        return Err(VerificationError::UnsupportedKey(format!(
            "timestamp signature algorithm {signature_alg}"
        )));
    };
    if hash == ID_SHA256 {
        Ok(vec![
            webpki::ring::ECDSA_P256_SHA256,
            webpki::ring::ECDSA_P384_SHA256,
        ])
    } else if hash == ID_SHA384 {
        Ok(vec![
            webpki::ring::ECDSA_P384_SHA384,
            webpki::ring::ECDSA_P256_SHA384,
        ])
    } else {
        Err(VerificationError::UnsupportedKey(format!(
            "timestamp signature hash {hash}"
        )))
    }
}

fn asn1_error(e: der::Error) -> VerificationError {
    timestamp_error(format!("malformed token: {e}"))
}

fn timestamp_error(reason: impl Into<String>) -> VerificationError {
    VerificationError::Timestamp(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNED_AT: i64 = 1740830405;

    fn fixture() -> (Bundle, TrustedRoot) {
        let bundle =
            Bundle::from_json(include_bytes!("../../tests/fixtures/bundle-v03-tsa.json")).unwrap();
        let root =
            TrustedRoot::from_json(include_bytes!("../../tests/fixtures/trusted_root.json")).unwrap();
        (bundle, root)
    }

    #[test]
    fn test_token_verifies_against_authority() {
        let (bundle, root) = fixture();
        let verified = verify_signed_timestamps(&bundle, &root);
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].uri, "https://tsa.sigpolicy.test");
        assert_eq!(verified[0].time.timestamp(), SIGNED_AT);
    }

    #[test]
    fn test_unknown_authority_is_not_counted() {
        let (bundle, mut root) = fixture();
        root.timestamp_authorities.clear();
        assert!(verify_signed_timestamps(&bundle, &root).is_empty());

        let public_good = TrustedRoot::from_json(include_bytes!(
            "../../tests/fixtures/sigstore_trusted_root.json"
        ))
        .unwrap();
        assert!(verify_signed_timestamps(&bundle, &public_good).is_empty());
    }

    #[test]
    fn test_imprint_must_cover_signature() {
        let (mut bundle, root) = fixture();
        let Some(Content::MessageSignature { signature, .. }) = bundle.content.as_mut() else {
            panic!("fixture is a message signature bundle");
        };
        signature[10] ^= 0xff;
        let token = &bundle.rfc3161_timestamps[0];
        let err = verify_token(token, countersigned_bytes(bundle.content.as_ref()).unwrap(), &root)
            .unwrap_err();
        assert!(err.to_string().contains("imprint"), "{err}");
        assert!(verify_signed_timestamps(&bundle, &root).is_empty());
    }

    #[test]
    fn test_authority_validity_window() {
        let (bundle, mut root) = fixture();
        root.timestamp_authorities[0].valid_for.end = Utc.timestamp_opt(SIGNED_AT - 1, 0).single();
        let signature = countersigned_bytes(bundle.content.as_ref()).unwrap();
        let err = verify_token(&bundle.rfc3161_timestamps[0], signature, &root).unwrap_err();
        assert!(err.to_string().contains("no timestamp authority"), "{err}");
    }

    #[test]
    fn test_signature_from_other_authority_fails() {
        let (bundle, mut root) = fixture();
        // Present the Fulcio chain as if it were the TSA's.
        root.timestamp_authorities[0].certificates = root.certificate_authorities[0].certificates.clone();
        let signature = countersigned_bytes(bundle.content.as_ref()).unwrap();
        assert!(verify_token(&bundle.rfc3161_timestamps[0], signature, &root).is_err());
    }

    #[test]
    fn test_malformed_tokens_are_skipped() {
        let (mut bundle, root) = fixture();
        bundle.rfc3161_timestamps.insert(0, b"not a timestamp".to_vec());
        let verified = verify_signed_timestamps(&bundle, &root);
        assert_eq!(verified.len(), 1);

        let err = verify_token(b"\x30\x03\x02\x01\x02", b"sig", &root).unwrap_err();
        assert!(matches!(err, VerificationError::Timestamp(_)), "{err}");
    }
}
