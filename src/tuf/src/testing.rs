//! An in-memory repository with real signatures, for tests.

use crate::http::{single_chunk, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::pkcs8::{EncodePublicKey, LineEnding};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tough::{Transport, TransportError, TransportErrorKind};
use url::Url;

const BASE_URL: &str = "https://tuf.example.test";

#[derive(Debug, Default)]
struct Served {
    files: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
    requests: AtomicUsize,
    delay: Mutex<Duration>,
}

/// Serves a fixed set of URLs from memory. Clones share their files.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    served: Arc<Served>,
}

impl MemoryTransport {
    pub fn insert(&self, url: impl Into<String>, data: Vec<u8>) {
        self.served
            .files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.into(), data);
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.served
            .files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    /// Make every request fail as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.served.offline.store(offline, Ordering::SeqCst);
    }

    /// Slow every request down by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.served.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn request_count(&self) -> usize {
        self.served.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, url: Url) -> Result<ByteStream, TransportError> {
        self.served.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.served.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.served.offline.load(Ordering::SeqCst) {
            return Err(TransportError::new_with_cause(
                TransportErrorKind::Other,
                &url,
                std::io::Error::new(std::io::ErrorKind::NotConnected, "network unreachable"),
            ));
        }
        match self.get(url.as_str()) {
            Some(data) => Ok(single_chunk(Bytes::from(data))),
            None => Err(TransportError::new(TransportErrorKind::FileNotFound, &url)),
        }
    }
}

/// A repository whose metadata is signed with deterministic P-256 keys.
///
/// The root role has one key that changes on every rotation; timestamp,
/// snapshot and targets share a second key. Consistent snapshots are on, so
/// the layout matches the public Sigstore repository.
pub struct TestRepo {
    seed: u8,
    root_keys: Vec<SigningKey>,
    online_key: SigningKey,
    roots: Vec<Vec<u8>>,
    timestamp_version: u64,
    snapshot_version: u64,
    targets_version: u64,
    targets: BTreeMap<String, Vec<u8>>,
    expiry: ChronoDuration,
    transport: MemoryTransport,
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRepo {
    pub fn new() -> Self {
        Self::new_with_seed(1)
    }

    /// Repositories built from different seeds share no keys.
    pub fn new_with_seed(seed: u8) -> Self {
        let mut repo = Self {
            seed,
            root_keys: vec![signing_key(seed, 0)],
            online_key: signing_key(seed, 100),
            roots: Vec::new(),
            timestamp_version: 0,
            snapshot_version: 0,
            targets_version: 0,
            targets: BTreeMap::new(),
            expiry: ChronoDuration::days(30),
            transport: MemoryTransport::default(),
        };
        let root = repo.root_document(1, &[0]);
        repo.transport
            .insert(format!("{BASE_URL}/1.root.json"), root.clone());
        repo.roots.push(root);
        repo
    }

    pub fn base_url(&self) -> String {
        BASE_URL.to_string()
    }

    pub fn transport(&self) -> MemoryTransport {
        self.transport.clone()
    }

    /// The serialized root of the given version, starting at 1.
    pub fn root_bytes(&self, version: u64) -> Vec<u8> {
        self.roots[(version - 1) as usize].clone()
    }

    pub fn root_version(&self) -> u64 {
        self.roots.len() as u64
    }

    pub fn targets_version(&self) -> u64 {
        self.targets_version
    }

    /// Lifetime of metadata signed from now on; negative values produce
    /// metadata that is already expired.
    pub fn set_expiry(&mut self, expiry: ChronoDuration) {
        self.expiry = expiry;
    }

    /// Stage a target; it becomes visible on the next [`TestRepo::publish`].
    pub fn add_target(&mut self, name: &str, data: &[u8]) {
        self.targets.insert(name.to_string(), data.to_vec());
    }

    /// Sign and serve new targets, snapshot and timestamp versions.
    pub fn publish(&mut self) {
        self.targets_version += 1;
        self.snapshot_version += 1;
        self.timestamp_version += 1;

        let mut entries = serde_json::Map::new();
        for (name, data) in &self.targets {
            let digest = hex::encode(Sha256::digest(data));
            entries.insert(
                name.clone(),
                json!({"length": data.len(), "hashes": {"sha256": digest}}),
            );
            self.transport
                .insert(format!("{BASE_URL}/targets/{digest}.{name}"), data.clone());
        }
        let targets = self.sign(
            json!({
                "_type": "targets",
                "spec_version": "1.0.0",
                "version": self.targets_version,
                "expires": self.expires(),
                "targets": entries,
            }),
            &[&self.online_key],
        );
        let snapshot = self.sign(
            json!({
                "_type": "snapshot",
                "spec_version": "1.0.0",
                "version": self.snapshot_version,
                "expires": self.expires(),
                "meta": {"targets.json": meta_file(self.targets_version, &targets)},
            }),
            &[&self.online_key],
        );
        let timestamp = self.sign(
            json!({
                "_type": "timestamp",
                "spec_version": "1.0.0",
                "version": self.timestamp_version,
                "expires": self.expires(),
                "meta": {"snapshot.json": meta_file(self.snapshot_version, &snapshot)},
            }),
            &[&self.online_key],
        );

        self.transport.insert(
            format!("{BASE_URL}/{}.targets.json", self.targets_version),
            targets,
        );
        self.transport.insert(
            format!("{BASE_URL}/{}.snapshot.json", self.snapshot_version),
            snapshot,
        );
        self.serve_timestamp(timestamp);
    }

    /// Publish a new root version signed by both the previous and the new root key.
    pub fn rotate_root(&mut self) {
        let index = self.root_keys.len();
        self.root_keys.push(signing_key(self.seed, index as u8));
        let version = self.roots.len() as u64 + 1;
        let root = self.root_document(version, &[index - 1, index]);
        self.transport
            .insert(format!("{BASE_URL}/{version}.root.json"), root.clone());
        self.roots.push(root);
    }

    pub fn current_timestamp(&self) -> Vec<u8> {
        self.transport
            .get(&format!("{BASE_URL}/timestamp.json"))
            .unwrap_or_default()
    }

    pub fn serve_timestamp(&self, data: Vec<u8>) {
        self.transport
            .insert(format!("{BASE_URL}/timestamp.json"), data);
    }

    /// Replace the served bytes of a published target without re-signing.
    pub fn tamper_target(&self, name: &str, data: &[u8]) {
        if let Some(original) = self.targets.get(name) {
            let digest = hex::encode(Sha256::digest(original));
            self.transport
                .insert(format!("{BASE_URL}/targets/{digest}.{name}"), data.to_vec());
        }
    }

    fn expires(&self) -> String {
        (Utc::now() + self.expiry)
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string()
    }

    fn root_document(&self, version: u64, signers: &[usize]) -> Vec<u8> {
        let root_key = self.root_keys.last().map(public_key).unwrap_or(Value::Null);
        let online_key = public_key(&self.online_key);
        let root_id = key_id(&root_key);
        let online_id = key_id(&online_key);
        let role = |id: &str| json!({"keyids": [id], "threshold": 1});

        let signed = json!({
            "_type": "root",
            "spec_version": "1.0.0",
            "version": version,
            "expires": self.expires(),
            "consistent_snapshot": true,
            "keys": {(root_id.clone()): root_key, (online_id.clone()): online_key},
            "roles": {
                "root": role(&root_id),
                "timestamp": role(&online_id),
                "snapshot": role(&online_id),
                "targets": role(&online_id),
            },
        });
        let keys: Vec<&SigningKey> = signers.iter().map(|i| &self.root_keys[*i]).collect();
        self.sign(signed, &keys)
    }

    fn sign(&self, signed: Value, keys: &[&SigningKey]) -> Vec<u8> {
        let canonical = canonicalize(&signed);
        let signatures: Vec<Value> = keys
            .iter()
            .map(|key| {
                let sig: Signature = key.sign(&canonical);
                json!({
                    "keyid": key_id(&public_key(key)),
                    "sig": hex::encode(sig.to_der().as_bytes()),
                })
            })
            .collect();
        serde_json::to_vec_pretty(&json!({"signed": signed, "signatures": signatures}))
            .unwrap_or_default()
    }
}

/// OLPC canonical JSON, the form over which metadata signatures are made.
fn canonicalize(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, olpc_cjson::CanonicalFormatter::new());
    match value.serialize(&mut ser) {
        Ok(()) => buf,
        Err(e) => panic!("canonical encoding failed: {e}"),
    }
}

fn signing_key(seed: u8, index: u8) -> SigningKey {
    let mut bytes = [seed; 32];
    bytes[0] = index.wrapping_add(1);
    SigningKey::from_bytes(&bytes.into()).unwrap_or_else(|_| panic!("invalid test key {seed}/{index}"))
}

fn public_key(key: &SigningKey) -> Value {
    let pem = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap_or_default();
    json!({
        "keytype": "ecdsa",
        "scheme": "ecdsa-sha2-nistp256",
        "keyval": {"public": pem},
    })
}

fn key_id(key: &Value) -> String {
    hex::encode(Sha256::digest(canonicalize(key)))
}

fn meta_file(version: u64, data: &[u8]) -> Value {
    json!({
        "version": version,
        "length": data.len(),
        "hashes": {"sha256": hex::encode(Sha256::digest(data))},
    })
}
