//! Identity policy applied to the signing certificate.

use super::certificate::CertificateSummary;
use super::signature::ArtifactDigest;
use super::VerificationError;
use regex::Regex;

/// Accepted signer identity: SAN and OIDC issuer patterns plus exact
/// extension values.
#[derive(Debug, Clone)]
pub struct IdentityPolicy {
    pub san: Regex,
    pub issuer: Regex,
    /// (serialized extension name, required value)
    pub extensions: Vec<(String, String)>,
}

impl IdentityPolicy {
    pub fn new(san: &str, issuer: &str) -> Result<Self, VerificationError> {
        let compile = |pattern: &str| {
            // Anchored so a pattern cannot match a substring of the identity.
            Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|e| VerificationError::Policy(format!("invalid pattern {pattern:?}: {e}")))
        };
        Ok(Self {
            san: compile(san)?,
            issuer: compile(issuer)?,
            extensions: Vec::new(),
        })
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.push((name.into(), value.into()));
        self
    }

    pub fn check(&self, summary: &CertificateSummary) -> Result<(), VerificationError> {
        if !self.san.is_match(&summary.subject_alternative_name) {
            return Err(VerificationError::Policy(format!(
                "subject alternative name {:?} does not match {}",
                summary.subject_alternative_name,
                self.san.as_str()
            )));
        }
        if !self.issuer.is_match(&summary.extensions.issuer) {
            return Err(VerificationError::Policy(format!(
                "issuer {:?} does not match {}",
                summary.extensions.issuer,
                self.issuer.as_str()
            )));
        }
        for (name, expected) in &self.extensions {
            let actual = summary.extensions.get(name).ok_or_else(|| {
                VerificationError::Policy(format!("unknown certificate extension {name}"))
            })?;
            if actual != expected {
                return Err(VerificationError::Policy(format!(
                    "extension {name} is {actual:?}, expected {expected:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Everything a bundle must satisfy besides cryptographic validity.
#[derive(Debug, Clone)]
pub struct Policy {
    pub identity: IdentityPolicy,
    pub artifact: ArtifactDigest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::certificate::Extensions;

    fn summary(runner: &str) -> CertificateSummary {
        CertificateSummary {
            certificate_issuer: "CN=sigstore-intermediate,O=sigstore.dev".to_string(),
            subject_alternative_name: "https://github.com/acme/widget/.github/workflows/release.yml@refs/heads/main".to_string(),
            extensions: Extensions {
                issuer: "https://token.actions.githubusercontent.com".to_string(),
                runner_environment: runner.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_accept_all_with_runner_constraint() {
        let policy = IdentityPolicy::new(".*", ".*")
            .unwrap()
            .with_extension("runnerEnvironment", "github-hosted");
        policy.check(&summary("github-hosted")).unwrap();
        let err = policy.check(&summary("self-hosted")).unwrap_err();
        assert!(err.to_string().contains("runnerEnvironment"));
    }

    #[test]
    fn test_patterns_are_anchored() {
        let policy = IdentityPolicy::new("https://github.com/acme/", ".*").unwrap();
        assert!(policy.check(&summary("github-hosted")).is_err());
        let policy = IdentityPolicy::new("https://github.com/acme/.*", "https://token\\.actions\\..*").unwrap();
        policy.check(&summary("github-hosted")).unwrap();
    }

    #[test]
    fn test_issuer_mismatch() {
        let policy = IdentityPolicy::new(".*", "https://accounts\\.google\\.com").unwrap();
        assert!(matches!(
            policy.check(&summary("github-hosted")),
            Err(VerificationError::Policy(_))
        ));
    }

    #[test]
    fn test_invalid_pattern_and_unknown_extension() {
        assert!(IdentityPolicy::new("(", ".*").is_err());
        let policy = IdentityPolicy::new(".*", ".*")
            .unwrap()
            .with_extension("runner", "github-hosted");
        assert!(policy.check(&summary("github-hosted")).is_err());
    }
}
