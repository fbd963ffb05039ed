//! A transport that can be switched between cache-only and network modes.

use crate::error::PolicyError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use sigpolicy_tuf::http::single_chunk;
use sigpolicy_tuf::ByteStream;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tough::{Transport, TransportError, TransportErrorKind};
use url::Url;

/// File holding the newest verified root metadata.
pub const ROOT_FILE: &str = "root.json";

const TARGETS_DIR: &str = "targets";

/// Wraps the network transport for one repository load.
///
/// Offline, every file is answered from the cache directory and anything not
/// cached is reported as missing, so `tough` settles on the metadata it
/// already has without touching the network. Online, downloads are staged in
/// memory and reach the cache only through [`AirgappedFetcher::commit`],
/// once the whole load has verified.
#[derive(Debug, Clone)]
pub struct AirgappedFetcher {
    inner: Arc<dyn Transport>,
    metadata_url: Url,
    targets_url: Url,
    cache_dir: PathBuf,
    online: bool,
    staged: Arc<Mutex<BTreeMap<PathBuf, Bytes>>>,
}

impl AirgappedFetcher {
    /// Both base URLs must end with a slash. The fetcher starts offline.
    pub fn new(
        inner: Arc<dyn Transport>,
        metadata_url: &Url,
        targets_url: &Url,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner,
            metadata_url: metadata_url.clone(),
            targets_url: targets_url.clone(),
            cache_dir: cache_dir.into(),
            online: false,
            staged: Arc::default(),
        }
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Write staged downloads to the cache.
    ///
    /// Root metadata is not cached per version: the newest one replaces
    /// [`ROOT_FILE`]. Versioned files supersede their older siblings.
    pub fn commit(&self) -> Result<(), PolicyError> {
        let staged = std::mem::take(&mut *self.staged.lock().unwrap_or_else(|e| e.into_inner()));
        let mut newest_root: Option<(u64, Bytes)> = None;
        for (relative, data) in staged {
            let name = relative
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if let Some(version) = root_version(name) {
                if newest_root.as_ref().map_or(true, |(v, _)| version > *v) {
                    newest_root = Some((version, data));
                }
                continue;
            }
            let path = self.cache_dir.join(&relative);
            write_atomic(&path, &data)?;
            prune_superseded(&path)?;
        }
        if let Some((version, data)) = newest_root {
            write_atomic(&self.cache_dir.join(ROOT_FILE), &data)?;
            log::info!(
                "trusted root metadata in {} is now version {version}",
                self.cache_dir.display()
            );
        }
        Ok(())
    }

    /// Cache location of `url` relative to the cache directory.
    fn cache_path(&self, url: &Url) -> Option<PathBuf> {
        if let Some(name) = url.as_str().strip_prefix(self.targets_url.as_str()) {
            return plain_file_name(name).then(|| Path::new(TARGETS_DIR).join(name));
        }
        let name = url.as_str().strip_prefix(self.metadata_url.as_str())?;
        plain_file_name(name).then(|| PathBuf::from(name))
    }

    fn read_cached(&self, url: &Url) -> Result<Bytes, TransportError> {
        let Some(relative) = self.cache_path(url) else {
            log::debug!("offline, {url} has no cache location");
            return Err(TransportError::new(TransportErrorKind::FileNotFound, url));
        };
        let path = self.cache_dir.join(relative);
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("offline, no cached copy of {url}");
                Err(TransportError::new(TransportErrorKind::FileNotFound, url))
            }
            Err(e) => Err(TransportError::new_with_cause(
                TransportErrorKind::Other,
                url,
                e,
            )),
        }
    }
}

#[async_trait]
impl Transport for AirgappedFetcher {
    async fn fetch(&self, url: Url) -> Result<ByteStream, TransportError> {
        if !self.online {
            return self.read_cached(&url).map(single_chunk);
        }
        let chunks: Vec<Bytes> = self.inner.fetch(url.clone()).await?.try_collect().await?;
        let data = Bytes::from(chunks.concat());
        if let Some(relative) = self.cache_path(&url) {
            self.staged
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(relative, data.clone());
        }
        Ok(single_chunk(data))
    }
}

/// A single path segment that cannot climb out of the cache directory.
fn plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '?', '#'])
}

/// "3.root.json" is root metadata version 3.
fn root_version(name: &str) -> Option<u64> {
    name.strip_suffix(".root.json")?.parse().ok()
}

/// Remove files that differ from `path` only in their version or hash prefix.
fn prune_superseded(path: &Path) -> Result<(), PolicyError> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
        return Ok(());
    };
    let Some((prefix, rest)) = name.split_once('.') else {
        return Ok(());
    };
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(());
    }
    let entries = fs::read_dir(dir).map_err(|source| cache_error(dir, source))?;
    for entry in entries.flatten() {
        let other = entry.file_name();
        let Some(other) = other.to_str() else { continue };
        let superseded = other != name
            && other
                .split_once('.')
                .is_some_and(|(p, r)| r == rest && p.chars().all(|c| c.is_ascii_hexdigit()));
        if superseded && entry.path().is_file() {
            fs::remove_file(entry.path()).map_err(|source| cache_error(&entry.path(), source))?;
            log::debug!("removed superseded {}", entry.path().display());
        }
    }
    Ok(())
}

/// Write through a temporary sibling and rename it into place.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PolicyError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| cache_error(dir, source))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    if let Err(source) = written.and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(cache_error(path, source));
    }
    Ok(())
}

fn cache_error(path: &Path, source: io::Error) -> PolicyError {
    PolicyError::Cache {
        path: path.display().to_string(),
        source,
    }
}
