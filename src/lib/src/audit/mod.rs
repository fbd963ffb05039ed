//! Audit logging for verification and trust-root refresh outcomes.
//!
//! Events are emitted through `tracing` under the `sigpolicy::audit` target,
//! separate from the `log` diagnostics the rest of the crate produces. Nothing
//! is recorded until [`init`] installs a subscriber.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sigpolicy::audit::{self, AuditConfig, LogDestination};
//!
//! audit::init(AuditConfig {
//!     destination: LogDestination::Stdout,
//!     ..AuditConfig::default()
//! })?;
//! ```
//!
//! # Event Types
//!
//! - `verification.attempt` - Artifact verification started
//! - `verification.success` - Artifact verified against the policy
//! - `verification.failure` - Artifact verification failed
//! - `trust.refresh.success` - Trust metadata refreshed
//! - `trust.refresh.failure` - Trust metadata refresh failed
//!
//! # JSON Output Example
//!
//! ```json
//! {
//!   "timestamp": "2026-01-04T20:00:00Z",
//!   "level": "INFO",
//!   "target": "sigpolicy::audit",
//!   "event_type": "verification.success",
//!   "correlation_id": "5b0c0d1e-...",
//!   "artifact_digest": "sha256:e3b0c442...",
//!   "signer_identity": "us***@example.com",
//!   "timestamps": 1
//! }
//! ```

use crate::error::PolicyError;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

pub const TARGET: &str = "sigpolicy::audit";

static AUDIT_INITIALIZED: OnceLock<bool> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub destination: LogDestination,
    pub json_format: bool,
    /// Redact e-mail identities in events.
    pub redact_pii: bool,
    /// `EnvFilter` directive, "sigpolicy::audit=info" by default.
    pub filter: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: LogDestination::Stderr,
            json_format: true,
            redact_pii: true,
            filter: format!("{TARGET}=info"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum LogDestination {
    Stdout,
    #[default]
    Stderr,
    File(String),
}

static REDACT_PII: OnceLock<bool> = OnceLock::new();

/// Install the audit subscriber. Only the first call has any effect.
pub fn init(config: AuditConfig) -> Result<(), PolicyError> {
    if AUDIT_INITIALIZED.get().is_some() {
        return Ok(());
    }
    let _ = REDACT_PII.set(config.redact_pii);

    if !config.enabled {
        let _ = AUDIT_INITIALIZED.set(true);
        return Ok(());
    }

    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.json_format;

    let installed = match config.destination {
        LogDestination::Stdout => install(filter, json, std::io::stdout),
        LogDestination::Stderr => install(filter, json, std::io::stderr),
        LogDestination::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| PolicyError::Cache {
                    path: path.clone(),
                    source,
                })?;
            install(filter, json, std::sync::Mutex::new(file))
        }
    };
    installed.map_err(|e| PolicyError::Configuration(format!("audit subscriber: {e}")))?;

    let _ = AUDIT_INITIALIZED.set(true);
    Ok(())
}

fn install<W>(
    filter: EnvFilter,
    json: bool,
    writer: W,
) -> Result<(), tracing_subscriber::util::TryInitError>
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_events(FmtSpan::NONE)
                    .with_writer(writer),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(writer))
            .try_init()
    }
}

/// Redact an e-mail address, "user@example.com" becomes "us***@example.com".
pub fn redact_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let visible: String = local.chars().take(2).collect();
            format!("{visible}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Workflow URIs are public; only personal e-mail identities are redacted.
pub fn display_identity(identity: Option<&str>) -> String {
    match identity {
        None | Some("") => "unknown".to_string(),
        Some(id) if id.contains('@') && !id.contains("://") => {
            if *REDACT_PII.get().unwrap_or(&true) {
                redact_email(id)
            } else {
                id.to_string()
            }
        }
        Some(id) => id.to_string(),
    }
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn log_verification_attempt(correlation_id: &str, artifact_digest: &str) {
    tracing::info!(
        target: TARGET,
        event_type = "verification.attempt",
        correlation_id = correlation_id,
        artifact_digest = artifact_digest,
        "Verification started"
    );
}

pub fn log_verification_success(
    correlation_id: &str,
    artifact_digest: &str,
    signer_identity: Option<&str>,
    issuer: Option<&str>,
    timestamps: usize,
) {
    tracing::info!(
        target: TARGET,
        event_type = "verification.success",
        correlation_id = correlation_id,
        artifact_digest = artifact_digest,
        signer_identity = %display_identity(signer_identity),
        issuer = issuer.unwrap_or("unknown"),
        timestamps = timestamps,
        "Artifact verified"
    );
}

pub fn log_verification_failure(
    correlation_id: &str,
    artifact_digest: &str,
    error_type: &str,
    error_message: &str,
) {
    tracing::warn!(
        target: TARGET,
        event_type = "verification.failure",
        correlation_id = correlation_id,
        artifact_digest = artifact_digest,
        error_type = error_type,
        error_message = %sanitize_error_message(error_message),
        "Verification failed"
    );
}

pub fn log_refresh_success(repository: &str, root_version: u64, targets_version: Option<u64>) {
    tracing::info!(
        target: TARGET,
        event_type = "trust.refresh.success",
        repository = repository,
        root_version = root_version,
        targets_version = targets_version.unwrap_or_default(),
        "Trust metadata refreshed"
    );
}

pub fn log_refresh_failure(repository: &str, error_message: &str) {
    tracing::warn!(
        target: TARGET,
        event_type = "trust.refresh.failure",
        repository = repository,
        error_message = %sanitize_error_message(error_message),
        "Trust metadata refresh failed"
    );
}

/// Drop token-like words and bound the length of messages that end up in audit logs.
fn sanitize_error_message(message: &str) -> String {
    let sanitized = message
        .split_whitespace()
        .map(|word| {
            if word.len() > 40 && word.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                "[REDACTED]"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if sanitized.chars().count() > 500 {
        let truncated: String = sanitized.chars().take(497).collect();
        format!("{truncated}...")
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_email() {
        assert_eq!(redact_email("user@example.com"), "us***@example.com");
        assert_eq!(redact_email("a@x.com"), "a***@x.com");
        assert_eq!(redact_email("invalid"), "***");
    }

    #[test]
    fn test_display_identity() {
        assert_eq!(display_identity(None), "unknown");
        assert_eq!(display_identity(Some("user@gmail.com")), "us***@gmail.com");
        let uri = "https://github.com/acme/widget/.github/workflows/release.yml@refs/tags/v1";
        assert_eq!(display_identity(Some(uri)), uri);
    }

    #[test]
    fn test_sanitize_error_message() {
        assert_eq!(sanitize_error_message("Connection failed"), "Connection failed");
        let with_token =
            "Failed with token eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9eyJzdWIiOiIxMjM0NTY3ODkwIn0";
        assert!(sanitize_error_message(with_token).contains("[REDACTED]"));

        let long = "é ".repeat(400);
        assert!(sanitize_error_message(&long).ends_with("..."));
    }

    #[test]
    fn test_correlation_id_format() {
        let id = new_correlation_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().filter(|c| *c == '-').count(), 4);
    }
}
