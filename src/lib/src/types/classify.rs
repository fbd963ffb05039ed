//! Provenance classification of verified signatures.
//!
//! [`SignatureInfo::detect_kind`] walks an ordered rule table and the first
//! matching rule decides the [`Kind`]. [`SignatureInfo::name`] renders the
//! stored kind for display and never fails.

use super::{Kind, SignatureInfo, SignatureType};
use crate::verify::CertificateSummary;

pub const SIGSTORE_INTERMEDIATE_ISSUER: &str = "CN=sigstore-intermediate,O=sigstore.dev";
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";
pub const GOOGLE_USER_ISSUER: &str = "https://accounts.google.com";
pub const GITHUB_USER_ISSUER: &str = "https://github.com/login/oauth";
pub const BUILDER_PREFIX: &str = "https://github.com/docker/github-builder/.github/workflows/";
pub const BUILDER_PREFIX_EXPERIMENTAL: &str =
    "https://github.com/docker/github-builder-experimental/.github/workflows/";

const GITHUB_HOSTED: &str = "github-hosted";
const GITHUB_URL: &str = "https://github.com/";

struct Rule {
    kind: Kind,
    matches: fn(&SignatureInfo) -> bool,
}

/// Most specific first; [`Kind::SELF_SIGNED`] is the fall-through.
const RULES: &[Rule] = &[
    Rule {
        kind: Kind::DOCKER_HARDENED_IMAGE,
        matches: is_hardened_image,
    },
    Rule {
        kind: Kind::UNTRUSTED,
        matches: is_untrusted,
    },
    Rule {
        kind: Kind::DOCKER_GITHUB_BUILDER,
        matches: is_github_builder,
    },
    Rule {
        kind: Kind::SELF_SIGNED_GITHUB_REPO,
        matches: is_github_repo_signed,
    },
];

fn is_hardened_image(info: &SignatureInfo) -> bool {
    info.is_dhi
}

fn is_untrusted(info: &SignatureInfo) -> bool {
    info.signer
        .as_ref()
        .map_or(true, |s| s.certificate_issuer != SIGSTORE_INTERMEDIATE_ISSUER)
}

fn is_github_builder(info: &SignatureInfo) -> bool {
    let Some(signer) = &info.signer else {
        return false;
    };
    let ext = &signer.extensions;
    builder_prefix(&signer.subject_alternative_name).is_some()
        && ext.issuer == GITHUB_ACTIONS_ISSUER
        && ext.build_trigger == "workflow_dispatch"
        && ext.runner_environment == GITHUB_HOSTED
        && ext.source_repository_uri.starts_with(GITHUB_URL)
        && ext.build_signer_uri == signer.subject_alternative_name
        && !info.timestamps.is_empty()
        && info.signature_type == SignatureType::BUNDLE_V03
}

fn is_github_repo_signed(info: &SignatureInfo) -> bool {
    let Some(signer) = &info.signer else {
        return false;
    };
    let ext = &signer.extensions;
    ext.issuer == GITHUB_ACTIONS_ISSUER
        && ext.runner_environment == GITHUB_HOSTED
        && !ext.source_repository_uri.is_empty()
        && ext.build_signer_uri == signer.subject_alternative_name
        && ext
            .build_signer_uri
            .starts_with(&format!("{}/.github/workflows/", ext.source_repository_uri))
}

/// The builder prefix `san` starts with, and whether it is the experimental one.
fn builder_prefix(san: &str) -> Option<bool> {
    if san.starts_with(BUILDER_PREFIX) {
        Some(false)
    } else if san.starts_with(BUILDER_PREFIX_EXPERIMENTAL) {
        Some(true)
    } else {
        None
    }
}

fn repository(signer: &CertificateSummary) -> &str {
    let uri = &signer.extensions.source_repository_uri;
    uri.strip_prefix(GITHUB_URL).unwrap_or(uri)
}

fn short_ref(reference: &str) -> &str {
    reference
        .strip_prefix("refs/heads/")
        .or_else(|| reference.strip_prefix("refs/tags/"))
        .unwrap_or(reference)
}

impl SignatureInfo {
    pub fn detect_kind(&self) -> Kind {
        RULES
            .iter()
            .find(|rule| (rule.matches)(self))
            .map_or(Kind::SELF_SIGNED, |rule| rule.kind)
    }

    /// Human-readable provenance, e.g. "GitHub Self-Signed (acme/widget)".
    pub fn name(&self) -> String {
        match self.kind {
            Kind::DOCKER_HARDENED_IMAGE => {
                format!("{} ({})", self.kind, self.docker_reference)
            }
            Kind::DOCKER_GITHUB_BUILDER => {
                let Some(signer) = &self.signer else {
                    return self.kind.to_string();
                };
                let label = match builder_prefix(&signer.subject_alternative_name) {
                    Some(true) => format!("{} Experimental", self.kind),
                    _ => self.kind.to_string(),
                };
                let reference = short_ref(&signer.extensions.source_repository_ref);
                if reference.is_empty() {
                    format!("{label} ({})", repository(signer))
                } else {
                    format!("{label} ({}@{reference})", repository(signer))
                }
            }
            Kind::SELF_SIGNED_GITHUB_REPO => match &self.signer {
                Some(signer) => format!("{} ({})", self.kind, repository(signer)),
                None => self.kind.to_string(),
            },
            Kind::SELF_SIGNED => {
                let ext = self.signer.as_ref().map(|s| &s.extensions);
                let hosted = ext.is_some_and(|e| e.runner_environment == GITHUB_HOSTED);
                let mut name = if hosted {
                    "Self-Signed".to_string()
                } else {
                    "Self-Signed Local".to_string()
                };
                if let Some(signer) = &self.signer {
                    let provider = match signer.extensions.issuer.as_str() {
                        GOOGLE_USER_ISSUER => Some("Google"),
                        GITHUB_USER_ISSUER => Some("GitHub"),
                        _ => None,
                    };
                    if let Some(provider) = provider {
                        name.push_str(&format!(
                            " ({provider}: {})",
                            signer.subject_alternative_name
                        ));
                    }
                }
                name
            }
            kind => kind.to_string(),
        }
    }
}
