//! A locally cached, periodically refreshed Sigstore trust root.
//!
//! Metadata comes from a TUF repository, verified by `tough`, and is cached
//! below the configured cache path:
//!
//! ```text
//! <cache_path>/.lock                                  cross-process lock
//! <cache_path>/<repository>/root.json                 newest trusted root, seeded if absent
//! <cache_path>/<repository>/timestamp.json
//! <cache_path>/<repository>/<v>.snapshot.json
//! <cache_path>/<repository>/<v>.targets.json
//! <cache_path>/<repository>/targets/<sha256>.trusted_root.json
//! <cache_path>/<repository>/datastore/                rollback state kept by tough
//! ```

mod config;
mod fetcher;
mod lock;
mod provider;
mod status;

pub use config::{url_to_path, RepositoryConfig, TrustRootConfig, DEFAULT_REPOSITORY, EMBEDDED_ROOT};
pub use fetcher::{AirgappedFetcher, ROOT_FILE};
pub use lock::{CacheLock, LOCK_FILE};
pub use provider::{TrustRootProvider, TRUSTED_ROOT_TARGET};
pub use status::Status;
