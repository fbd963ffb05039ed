//! HTTP(S) transport on the blocking `ureq` client.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::io::Read;
use std::pin::Pin;
use std::time::Duration;
use tough::{Transport, TransportError, TransportErrorKind};
use url::Url;

/// Body stream handed to `tough`.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// A stream yielding `data` in one chunk.
pub fn single_chunk(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::iter(std::iter::once(Ok(data))))
}

/// Downloads each file in one blocking request on the blocking thread pool.
///
/// `tough` applies its own per-role size limits while reading; `max_length`
/// only bounds what is buffered before that.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    timeout: Duration,
    max_length: u64,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl HttpTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_LENGTH: u64 = 32 * 1024 * 1024;

    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            timeout,
            max_length: Self::DEFAULT_MAX_LENGTH,
        }
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: Url) -> Result<ByteStream, TransportError> {
        let agent = self.agent.clone();
        let max_length = self.max_length;
        let request = url.clone();
        let data = tokio::task::spawn_blocking(move || get(&agent, &request, max_length))
            .await
            .map_err(|e| TransportError::new_with_cause(TransportErrorKind::Other, &url, e))??;
        Ok(single_chunk(data))
    }
}

fn get(agent: &ureq::Agent, url: &Url, max_length: u64) -> Result<Bytes, TransportError> {
    log::debug!("GET {url}");
    let response = match agent.get(url.as_str()).call() {
        Ok(response) => response,
        // Object stores answer 403 for keys that do not exist.
        Err(ureq::Error::StatusCode(403 | 404)) => {
            return Err(TransportError::new(TransportErrorKind::FileNotFound, url))
        }
        Err(e) => return Err(TransportError::new_with_cause(TransportErrorKind::Other, url, e)),
    };

    let mut body = response.into_body();
    let mut data = Vec::new();
    // One extra byte so an oversized body is detected rather than truncated.
    body.as_reader()
        .take(max_length.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|e| TransportError::new_with_cause(TransportErrorKind::Other, url, e))?;
    if data.len() as u64 > max_length {
        return Err(TransportError::new_with_cause(
            TransportErrorKind::Other,
            url,
            format!("response exceeds {max_length} bytes"),
        ));
    }
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_single_chunk_stream() {
        let chunks: Vec<Bytes> = single_chunk(Bytes::from_static(b"metadata"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"metadata")]);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_not_file_not_found() {
        let transport = HttpTransport::new(Duration::from_secs(2));
        let url = Url::parse("http://127.0.0.1:9/1.root.json").unwrap();
        let err = transport.fetch(url).await.err().unwrap();
        assert_eq!(err.kind(), TransportErrorKind::Other);
    }
}
