//! Signing certificate parsing and the Fulcio extension summary.

use super::VerificationError;
use p256::ecdsa::VerifyingKey;
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use x509_parser::oid_registry::Oid;
use x509_parser::prelude::*;

const FULCIO_OID_PREFIX: &str = "1.3.6.1.4.1.57264.1.";

/// Identity claims Fulcio embeds in a signing certificate.
///
/// Arcs 1 through 6 are deprecated raw-string encodings; arcs 8 and up are
/// DER strings. Field names serialize the way Sigstore clients report them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub github_workflow_trigger: String,
    #[serde(
        default,
        rename = "githubWorkflowSHA",
        skip_serializing_if = "String::is_empty"
    )]
    pub github_workflow_sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub github_workflow_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub github_workflow_repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub github_workflow_ref: String,
    #[serde(
        default,
        rename = "buildSignerURI",
        skip_serializing_if = "String::is_empty"
    )]
    pub build_signer_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_signer_digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runner_environment: String,
    #[serde(
        default,
        rename = "sourceRepositoryURI",
        skip_serializing_if = "String::is_empty"
    )]
    pub source_repository_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_repository_digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_repository_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_repository_identifier: String,
    #[serde(
        default,
        rename = "sourceRepositoryOwnerURI",
        skip_serializing_if = "String::is_empty"
    )]
    pub source_repository_owner_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_repository_owner_identifier: String,
    #[serde(
        default,
        rename = "buildConfigURI",
        skip_serializing_if = "String::is_empty"
    )]
    pub build_config_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_config_digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_trigger: String,
    #[serde(
        default,
        rename = "runInvocationURI",
        skip_serializing_if = "String::is_empty"
    )]
    pub run_invocation_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_repository_visibility_at_signing: String,
}

impl Extensions {
    /// Look up an extension by its serialized name, e.g. "runnerEnvironment".
    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            "issuer" => &self.issuer,
            "githubWorkflowTrigger" => &self.github_workflow_trigger,
            "githubWorkflowSHA" => &self.github_workflow_sha,
            "githubWorkflowName" => &self.github_workflow_name,
            "githubWorkflowRepository" => &self.github_workflow_repository,
            "githubWorkflowRef" => &self.github_workflow_ref,
            "buildSignerURI" => &self.build_signer_uri,
            "buildSignerDigest" => &self.build_signer_digest,
            "runnerEnvironment" => &self.runner_environment,
            "sourceRepositoryURI" => &self.source_repository_uri,
            "sourceRepositoryDigest" => &self.source_repository_digest,
            "sourceRepositoryRef" => &self.source_repository_ref,
            "sourceRepositoryIdentifier" => &self.source_repository_identifier,
            "sourceRepositoryOwnerURI" => &self.source_repository_owner_uri,
            "sourceRepositoryOwnerIdentifier" => &self.source_repository_owner_identifier,
            "buildConfigURI" => &self.build_config_uri,
            "buildConfigDigest" => &self.build_config_digest,
            "buildTrigger" => &self.build_trigger,
            "runInvocationURI" => &self.run_invocation_uri,
            "sourceRepositoryVisibilityAtSigning" => &self.source_repository_visibility_at_signing,
            _ => return None,
        };
        Some(value.as_str())
    }

    fn set(&mut self, arc: u32, value: &[u8]) -> Result<(), VerificationError> {
        let text = |raw: &[u8]| {
            std::str::from_utf8(raw)
                .map(str::to_string)
                .map_err(|_| certificate_error(format!("extension .{arc} is not UTF-8")))
        };
        match arc {
            // The deprecated issuer only applies when the DER one is absent.
            1 if self.issuer.is_empty() => self.issuer = text(value)?,
            2 => self.github_workflow_trigger = text(value)?,
            3 => self.github_workflow_sha = text(value)?,
            4 => self.github_workflow_name = text(value)?,
            5 => self.github_workflow_repository = text(value)?,
            6 => self.github_workflow_ref = text(value)?,
            8..=22 => {
                let value = der_string(value)
                    .ok_or_else(|| certificate_error(format!("extension .{arc} is not a DER string")))?;
                let field = match arc {
                    8 => &mut self.issuer,
                    9 => &mut self.build_signer_uri,
                    10 => &mut self.build_signer_digest,
                    11 => &mut self.runner_environment,
                    12 => &mut self.source_repository_uri,
                    13 => &mut self.source_repository_digest,
                    14 => &mut self.source_repository_ref,
                    15 => &mut self.source_repository_identifier,
                    16 => &mut self.source_repository_owner_uri,
                    17 => &mut self.source_repository_owner_identifier,
                    18 => &mut self.build_config_uri,
                    19 => &mut self.build_config_digest,
                    20 => &mut self.build_trigger,
                    21 => &mut self.run_invocation_uri,
                    _ => &mut self.source_repository_visibility_at_signing,
                };
                *field = value;
            }
            _ => {}
        }
        Ok(())
    }
}

/// The signer summary reported for a verified certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSummary {
    /// Issuer distinguished name, most specific attribute first.
    pub certificate_issuer: String,
    pub subject_alternative_name: String,
    #[serde(flatten)]
    pub extensions: Extensions,
}

/// A parsed leaf certificate together with the pieces later checks need.
pub struct LeafCertificate {
    pub der: Vec<u8>,
    pub summary: CertificateSummary,
    pub public_key: VerifyingKey,
    /// DER of the issuer name, used to find the issuing CA certificate.
    pub issuer_der: Vec<u8>,
    /// Raw value of the embedded SCT list extension, if any.
    pub sct_list: Option<Vec<u8>>,
    pub not_before: i64,
    pub not_after: i64,
}

pub const SCT_LIST_OID: &str = "1.3.6.1.4.1.11129.2.4.2";

impl LeafCertificate {
    pub fn parse(der: &[u8]) -> Result<Self, VerificationError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| certificate_error(format!("failed to parse certificate: {e}")))?;

        let mut extensions = Extensions::default();
        let mut sct_list = None;
        // Arc 8 must win over arc 1 regardless of extension order.
        let mut ordered: Vec<(u32, &[u8])> = Vec::new();
        for ext in cert.extensions() {
            let oid = ext.oid.to_id_string();
            if oid == SCT_LIST_OID {
                sct_list = Some(ext.value.to_vec());
            } else if let Some(arc) = oid
                .strip_prefix(FULCIO_OID_PREFIX)
                .and_then(|arc| arc.parse::<u32>().ok())
            {
                ordered.push((arc, ext.value));
            }
        }
        ordered.sort_by_key(|(arc, _)| std::cmp::Reverse(*arc == 8));
        for (arc, value) in ordered {
            extensions.set(arc, value)?;
        }

        let subject_alternative_name = subject_alternative_name(&cert)?;
        let public_key = VerifyingKey::from_public_key_der(cert.public_key().raw).map_err(|e| {
            VerificationError::UnsupportedKey(format!("signing certificate key: {e}"))
        })?;

        Ok(LeafCertificate {
            der: der.to_vec(),
            summary: CertificateSummary {
                certificate_issuer: distinguished_name(cert.issuer()),
                subject_alternative_name,
                extensions,
            },
            public_key,
            issuer_der: cert.issuer().as_raw().to_vec(),
            sct_list,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}

fn subject_alternative_name(cert: &X509Certificate<'_>) -> Result<String, VerificationError> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| certificate_error(format!("bad subject alternative name: {e}")))?
        .ok_or_else(|| certificate_error("certificate has no subject alternative name"))?;
    san.value
        .general_names
        .iter()
        .find_map(|name| match name {
            GeneralName::URI(uri) => Some(uri.to_string()),
            GeneralName::RFC822Name(email) => Some(email.to_string()),
            _ => None,
        })
        .ok_or_else(|| certificate_error("subject alternative name has no URI or e-mail"))
}

/// Format a name with the most specific RDN first: "CN=sigstore-intermediate,O=sigstore.dev".
pub fn distinguished_name(name: &X509Name<'_>) -> String {
    let mut parts: Vec<String> = Vec::new();
    for rdn in name.iter() {
        let attrs: Vec<String> = rdn
            .iter()
            .filter_map(|attr| {
                let value = attr.as_str().ok()?;
                Some(format!("{}={}", attribute_label(attr.attr_type()), value))
            })
            .collect();
        if !attrs.is_empty() {
            parts.push(attrs.join("+"));
        }
    }
    parts.reverse();
    parts.join(",")
}

fn attribute_label(oid: &Oid<'_>) -> String {
    match oid.to_id_string().as_str() {
        "2.5.4.3" => "CN".to_string(),
        "2.5.4.5" => "SERIALNUMBER".to_string(),
        "2.5.4.6" => "C".to_string(),
        "2.5.4.7" => "L".to_string(),
        "2.5.4.8" => "ST".to_string(),
        "2.5.4.9" => "STREET".to_string(),
        "2.5.4.10" => "O".to_string(),
        "2.5.4.11" => "OU".to_string(),
        "2.5.4.17" => "POSTALCODE".to_string(),
        other => other.to_string(),
    }
}

/// Decode a DER UTF8String, PrintableString or IA5String.
fn der_string(value: &[u8]) -> Option<String> {
    let body = der_contents(value, &[0x0c, 0x13, 0x16])?;
    String::from_utf8(body.to_vec()).ok()
}

/// Contents of a single definite-length DER value carrying one of `tags`.
pub(crate) fn der_contents<'a>(value: &'a [u8], tags: &[u8]) -> Option<&'a [u8]> {
    let (tag, rest) = value.split_first()?;
    if !tags.contains(tag) {
        return None;
    }
    let (&first, rest) = rest.split_first()?;
    let (len, body) = if first & 0x80 == 0 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    (body.len() == len).then_some(body)
}

fn certificate_error(reason: impl Into<String>) -> VerificationError {
    VerificationError::Certificate(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn leaf_der(fixture: &str) -> Vec<u8> {
        let path = format!("{}/tests/fixtures/{fixture}", env!("CARGO_MANIFEST_DIR"));
        let bundle: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        let raw = bundle["verificationMaterial"]["certificate"]["rawBytes"]
            .as_str()
            .unwrap();
        BASE64.decode(raw).unwrap()
    }

    #[test]
    fn test_parse_fulcio_leaf() {
        let leaf = LeafCertificate::parse(&leaf_der("bundle-v03.json")).unwrap();
        let summary = &leaf.summary;
        assert_eq!(
            summary.certificate_issuer,
            "CN=sigstore-intermediate,O=sigstore.dev"
        );
        assert_eq!(
            summary.subject_alternative_name,
            "https://github.com/acme/widget/.github/workflows/release.yml@refs/tags/v1.2.3"
        );
        let ext = &summary.extensions;
        assert_eq!(ext.issuer, "https://token.actions.githubusercontent.com");
        assert_eq!(ext.runner_environment, "github-hosted");
        assert_eq!(ext.source_repository_uri, "https://github.com/acme/widget");
        assert_eq!(ext.source_repository_ref, "refs/tags/v1.2.3");
        assert_eq!(ext.build_signer_uri, summary.subject_alternative_name);
        assert_eq!(ext.build_trigger, "push");
        assert_eq!(ext.github_workflow_trigger, "push");
        assert_eq!(ext.source_repository_visibility_at_signing, "public");
        assert!(leaf.sct_list.is_some());
        assert_eq!(leaf.not_after - leaf.not_before, 660);
    }

    #[test]
    fn test_self_hosted_runner_extension() {
        let leaf = LeafCertificate::parse(&leaf_der("bundle-v03-self-hosted.json")).unwrap();
        assert_eq!(leaf.summary.extensions.runner_environment, "self-hosted");
        assert_eq!(
            leaf.summary.extensions.get("runnerEnvironment"),
            Some("self-hosted")
        );
        assert_eq!(leaf.summary.extensions.get("noSuchExtension"), None);
    }

    #[test]
    fn test_summary_json_field_names() {
        let leaf = LeafCertificate::parse(&leaf_der("bundle-v03.json")).unwrap();
        let json = serde_json::to_value(&leaf.summary).unwrap();
        assert!(json.get("certificateIssuer").is_some());
        assert!(json.get("subjectAlternativeName").is_some());
        assert!(json.get("buildSignerURI").is_some());
        assert!(json.get("sourceRepositoryURI").is_some());
        assert!(json.get("githubWorkflowSHA").is_some());
        assert!(json.get("runInvocationURI").is_some());
        assert_eq!(json["runnerEnvironment"], "github-hosted");
    }

    #[test]
    fn test_der_string() {
        assert_eq!(der_string(&[0x0c, 0x02, b'o', b'k']).as_deref(), Some("ok"));
        assert_eq!(der_string(&[0x16, 0x01, b'x']).as_deref(), Some("x"));
        assert_eq!(der_string(&[0x04, 0x01, b'x']), None);
        assert_eq!(der_string(&[0x0c, 0x05, b'x']), None);
        let long = vec![b'a'; 200];
        let mut encoded = vec![0x0c, 0x81, 200];
        encoded.extend_from_slice(&long);
        assert_eq!(der_string(&encoded).map(|s| s.len()), Some(200));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            LeafCertificate::parse(b"not a certificate"),
            Err(VerificationError::Certificate(_))
        ));
    }
}
