//! Provenance classification of signature results.

use chrono::Utc;
use sigpolicy::types::{
    Kind, SignatureInfo, SignatureType, TimestampVerificationResult, BUILDER_PREFIX,
    BUILDER_PREFIX_EXPERIMENTAL, GITHUB_ACTIONS_ISSUER, GITHUB_USER_ISSUER, GOOGLE_USER_ISSUER,
    SIGSTORE_INTERMEDIATE_ISSUER,
};
use sigpolicy::verify::{CertificateSummary, Extensions};

fn timestamps() -> Vec<TimestampVerificationResult> {
    vec![TimestampVerificationResult {
        kind: "Tlog".to_string(),
        uri: "https://rekor.sigstore.dev".to_string(),
        timestamp: Utc::now(),
    }]
}

fn signer(san: &str, extensions: Extensions) -> Option<CertificateSummary> {
    Some(CertificateSummary {
        certificate_issuer: SIGSTORE_INTERMEDIATE_ISSUER.to_string(),
        subject_alternative_name: san.to_string(),
        extensions,
    })
}

fn builder_extensions(repo: &str, reference: &str, signer_uri: &str) -> Extensions {
    Extensions {
        issuer: GITHUB_ACTIONS_ISSUER.to_string(),
        build_trigger: "workflow_dispatch".to_string(),
        runner_environment: "github-hosted".to_string(),
        source_repository_uri: repo.to_string(),
        source_repository_ref: reference.to_string(),
        build_signer_uri: signer_uri.to_string(),
        ..Default::default()
    }
}

fn personal(san: &str, issuer: &str, runner: &str) -> SignatureInfo {
    SignatureInfo {
        kind: Kind::SELF_SIGNED,
        signer: signer(
            san,
            Extensions {
                issuer: issuer.to_string(),
                runner_environment: runner.to_string(),
                ..Default::default()
            },
        ),
        ..Default::default()
    }
}

fn cases() -> Vec<(&'static str, SignatureInfo, String)> {
    let build = format!("{BUILDER_PREFIX}build.yml");
    let experimental = format!("{BUILDER_PREFIX_EXPERIMENTAL}exp.yml");
    let release = format!("{BUILDER_PREFIX}release.yml");

    vec![
        (
            "dhi-basic",
            SignatureInfo {
                kind: Kind::DOCKER_HARDENED_IMAGE,
                is_dhi: true,
                docker_reference: "docker.io/dhi/golang".to_string(),
                ..Default::default()
            },
            "Docker Hardened Image (docker.io/dhi/golang)".to_string(),
        ),
        (
            "github-builder-main-branch",
            SignatureInfo {
                kind: Kind::DOCKER_GITHUB_BUILDER,
                timestamps: timestamps(),
                signature_type: SignatureType::BUNDLE_V03,
                signer: signer(
                    &build,
                    builder_extensions("https://github.com/docker/buildx", "refs/heads/main", &build),
                ),
                ..Default::default()
            },
            "Docker GitHub Builder (docker/buildx@main)".to_string(),
        ),
        (
            "github-builder-experimental",
            SignatureInfo {
                kind: Kind::DOCKER_GITHUB_BUILDER,
                timestamps: timestamps(),
                signature_type: SignatureType::BUNDLE_V03,
                signer: signer(
                    &experimental,
                    builder_extensions(
                        "https://github.com/docker/buildx",
                        "refs/tags/v1.0.0",
                        &experimental,
                    ),
                ),
                ..Default::default()
            },
            "Docker GitHub Builder Experimental (docker/buildx@v1.0.0)".to_string(),
        ),
        (
            "github-builder-hashedrekord-is-self-signed",
            SignatureInfo {
                kind: Kind::SELF_SIGNED,
                timestamps: timestamps(),
                signature_type: SignatureType::SIMPLE_SIGNING_V1,
                signer: signer(
                    &build,
                    builder_extensions("https://github.com/docker/buildx", "refs/heads/main", &build),
                ),
                ..Default::default()
            },
            "Self-Signed".to_string(),
        ),
        (
            "github-self-signed",
            SignatureInfo {
                kind: Kind::SELF_SIGNED_GITHUB_REPO,
                signer: signer(
                    "https://github.com/foo/bar/.github/workflows/ci.yml",
                    Extensions {
                        issuer: GITHUB_ACTIONS_ISSUER.to_string(),
                        runner_environment: "github-hosted".to_string(),
                        source_repository_uri: "https://github.com/foo/bar".to_string(),
                        build_signer_uri: "https://github.com/foo/bar/.github/workflows/ci.yml"
                            .to_string(),
                        ..Default::default()
                    },
                ),
                ..Default::default()
            },
            "GitHub Self-Signed (foo/bar)".to_string(),
        ),
        (
            "self-signed-google-local",
            personal("user@gmail.com", GOOGLE_USER_ISSUER, "my-desktop"),
            "Self-Signed Local (Google: user@gmail.com)".to_string(),
        ),
        (
            "self-signed-github-oauth-hosted",
            personal("octocat", GITHUB_USER_ISSUER, "github-hosted"),
            "Self-Signed (GitHub: octocat)".to_string(),
        ),
        (
            "self-signed-github-oauth-local",
            personal("octo-user", GITHUB_USER_ISSUER, "my-mac"),
            "Self-Signed Local (GitHub: octo-user)".to_string(),
        ),
        (
            "self-signed-google-hosted",
            personal("user@gmail.com", GOOGLE_USER_ISSUER, "github-hosted"),
            "Self-Signed (Google: user@gmail.com)".to_string(),
        ),
        (
            "self-signed-empty-san",
            personal("", GOOGLE_USER_ISSUER, "my-desktop"),
            "Self-Signed Local (Google: )".to_string(),
        ),
        (
            "no-signer",
            SignatureInfo {
                kind: Kind::UNTRUSTED,
                ..Default::default()
            },
            "Untrusted".to_string(),
        ),
        (
            "wrong-certificate-issuer",
            SignatureInfo {
                kind: Kind::UNTRUSTED,
                signer: Some(CertificateSummary {
                    certificate_issuer: "BAD".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            "Untrusted".to_string(),
        ),
        (
            "builder-without-timestamps",
            SignatureInfo {
                kind: Kind::SELF_SIGNED,
                signer: signer(
                    BUILDER_PREFIX,
                    builder_extensions("https://github.com/foo/bar", "refs/heads/main", BUILDER_PREFIX),
                ),
                ..Default::default()
            },
            "Self-Signed".to_string(),
        ),
        (
            "builder-with-push-trigger",
            SignatureInfo {
                kind: Kind::SELF_SIGNED,
                timestamps: timestamps(),
                signature_type: SignatureType::BUNDLE_V03,
                signer: signer(
                    BUILDER_PREFIX,
                    Extensions {
                        build_trigger: "push".to_string(),
                        ..builder_extensions(
                            "https://github.com/foo/bar",
                            "refs/heads/main",
                            BUILDER_PREFIX,
                        )
                    },
                ),
                ..Default::default()
            },
            "Self-Signed".to_string(),
        ),
        (
            "builder-on-self-hosted-runner",
            SignatureInfo {
                kind: Kind::SELF_SIGNED,
                timestamps: timestamps(),
                signer: signer(
                    BUILDER_PREFIX,
                    Extensions {
                        runner_environment: "self-hosted".to_string(),
                        ..builder_extensions(
                            "https://github.com/foo/bar",
                            "refs/heads/main",
                            BUILDER_PREFIX,
                        )
                    },
                ),
                ..Default::default()
            },
            "Self-Signed Local".to_string(),
        ),
        (
            "unknown-builder-uri",
            SignatureInfo {
                kind: Kind::SELF_SIGNED,
                timestamps: timestamps(),
                signer: signer(
                    "https://example.com/x",
                    builder_extensions(
                        "https://github.com/foo/bar",
                        "refs/heads/main",
                        "https://example.com/x",
                    ),
                ),
                ..Default::default()
            },
            "Self-Signed".to_string(),
        ),
        (
            "github-builder-tag-ref",
            SignatureInfo {
                kind: Kind::DOCKER_GITHUB_BUILDER,
                timestamps: timestamps(),
                signature_type: SignatureType::BUNDLE_V03,
                signer: signer(
                    &release,
                    builder_extensions("https://github.com/acme/rocket", "refs/tags/v9.9.9", &release),
                ),
                ..Default::default()
            },
            "Docker GitHub Builder (acme/rocket@v9.9.9)".to_string(),
        ),
        (
            "builder-source-not-on-github",
            SignatureInfo {
                kind: Kind::SELF_SIGNED,
                timestamps: timestamps(),
                signature_type: SignatureType::BUNDLE_V03,
                signer: signer(
                    &build,
                    builder_extensions("https://gitlab.com/foo/bar", "refs/heads/main", &build),
                ),
                ..Default::default()
            },
            "Self-Signed".to_string(),
        ),
        (
            "github-repo-signer-uri-typo",
            SignatureInfo {
                kind: Kind::SELF_SIGNED,
                signer: signer(
                    "https://github.com/foo/bar/.github/workflows/x.yml",
                    Extensions {
                        issuer: GITHUB_ACTIONS_ISSUER.to_string(),
                        runner_environment: "github-hosted".to_string(),
                        source_repository_uri: "https://github.com/foo/bar".to_string(),
                        build_signer_uri:
                            "https://github.com/foo/bar/.github/workflows-typo/x.yml".to_string(),
                        ..Default::default()
                    },
                ),
                ..Default::default()
            },
            "Self-Signed".to_string(),
        ),
        (
            "corruption",
            SignatureInfo {
                kind: Kind(0),
                ..Default::default()
            },
            "Invalid".to_string(),
        ),
    ]
}

#[test]
fn test_signature_info_name() {
    for (name, info, want) in cases() {
        if info.kind != Kind(0) {
            assert_eq!(info.detect_kind(), info.kind, "{name}: detected kind");
        }
        assert_eq!(info.name(), want, "{name}: display name");
    }
}

#[test]
fn test_detection_is_idempotent() {
    for (name, mut info, _) in cases() {
        info.kind = info.detect_kind();
        let first = info.clone();
        info.kind = info.detect_kind();
        assert_eq!(info, first, "{name}");
    }
}

#[test]
fn test_out_of_range_kinds_render_invalid() {
    for kind in [Kind(-1), Kind(5), Kind(999), Kind(1001)] {
        let info = SignatureInfo {
            kind,
            ..Default::default()
        };
        assert_eq!(info.name(), "Invalid");
    }
}

#[test]
fn test_result_serializes_with_classification() {
    let (_, mut info, _) = cases().remove(1);
    info.kind = info.detect_kind();
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["kind"], 1);
    assert_eq!(json["signatureType"], 1);
    assert_eq!(json["signer"]["certificateIssuer"], SIGSTORE_INTERMEDIATE_ISSUER);
    assert_eq!(json["signer"]["buildTrigger"], "workflow_dispatch");
    assert_eq!(json["timestamps"][0]["type"], "Tlog");
}
