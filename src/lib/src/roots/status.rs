use crate::error::PolicyError;
use crate::types::TrustRootStatus;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Outcome of the most recent refresh attempt.
///
/// A failed attempt keeps the time of the last success so the provider can
/// keep serving the material that success produced.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub error: Option<Arc<PolicyError>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Status {
    pub fn succeeded(at: DateTime<Utc>) -> Self {
        Self {
            error: None,
            last_updated: Some(at),
        }
    }

    /// Record `error` on top of `self`.
    pub fn failed(&self, error: Arc<PolicyError>) -> Self {
        Self {
            error: Some(error),
            last_updated: self.last_updated,
        }
    }

    /// At least one refresh has completed.
    pub fn has_succeeded(&self) -> bool {
        self.last_updated.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

impl From<&Status> for TrustRootStatus {
    fn from(status: &Status) -> Self {
        TrustRootStatus {
            error: status.error.as_ref().map(|e| e.to_string()),
            last_updated: status.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_keeps_last_success() {
        let at = Utc::now();
        let ok = Status::succeeded(at);
        assert!(ok.has_succeeded());
        assert!(!ok.is_degraded());

        let failed = ok.failed(Arc::new(PolicyError::NotYetAvailable("offline".into())));
        assert!(failed.has_succeeded());
        assert!(failed.is_degraded());
        assert_eq!(failed.last_updated, Some(at));

        let reported = TrustRootStatus::from(&failed);
        assert_eq!(
            reported.error.as_deref(),
            Some("Trust root not yet available: offline")
        );
        assert_eq!(reported.last_updated, Some(at));
    }

    #[test]
    fn test_never_succeeded() {
        let status = Status::default().failed(Arc::new(PolicyError::Internal("x".into())));
        assert!(!status.has_succeeded());
        assert!(TrustRootStatus::from(&Status::default()).is_empty());
    }
}
