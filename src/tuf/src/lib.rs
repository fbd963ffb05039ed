//! Transports for the `tough` TUF client.
//!
//! [`HttpTransport`] downloads repository files with a bounded response size.
//! The `testing` feature adds an in-memory, really signed repository.

pub mod http;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use http::{ByteStream, HttpTransport};
pub use tough;
