#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use futures::StreamExt;
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, Semaphore};

use trusted_updater::{
    encode_public_key, key_id, AutoApprove, Download, MetaFileInfo, ReleaseDocument, RetryPolicy,
    Role, RoleKeys, RootMetadata, SignedEnvelope, SnapshotMetadata, TargetFile, TimestampMetadata,
    Transport, TransportError, UpdateClient, UpdateClientBuilder, UpdaterConfig,
};

pub const METADATA_URL: &str = "https://updates.example.test/metadata/";
pub const TARGET_URL: &str = "https://updates.example.test/targets/";

const CHUNK: usize = 7;

#[derive(Default)]
struct Inner {
    files: HashMap<String, Vec<u8>>,
    failures: HashMap<String, u32>,
    cut_after: HashMap<String, usize>,
    requests: Vec<(String, u64)>,
}

/// In-memory update server.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransport {
    pub fn put(&self, url: &str, bytes: Vec<u8>) {
        self.inner.lock().unwrap().files.insert(url.to_string(), bytes);
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(url).cloned()
    }

    pub fn remove(&self, url: &str) {
        self.inner.lock().unwrap().files.remove(url);
    }

    /// Fail the next `times` requests for `url` with a connection error.
    pub fn fail_next(&self, url: &str, times: u32) {
        self.inner.lock().unwrap().failures.insert(url.to_string(), times);
    }

    /// Drop the connection after `bytes` bytes on the next request for `url`.
    pub fn cut_once(&self, url: &str, bytes: usize) {
        self.inner.lock().unwrap().cut_after.insert(url.to_string(), bytes);
    }

    /// Offsets requested for `url`, in order.
    pub fn offsets(&self, url: &str) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(requested, _)| requested == url)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &Url, offset: u64) -> Result<Download, TransportError> {
        let key = url.to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push((key.clone(), offset));

        if let Some(remaining) = inner.failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Other("connection refused".to_string()));
            }
        }
        let body = inner
            .files
            .get(&key)
            .cloned()
            .ok_or(TransportError::NotFound { url: key.clone() })?;

        let start = if (offset as usize) <= body.len() { offset as usize } else { 0 };
        let mut served = body[start..].to_vec();
        let cut = inner.cut_after.remove(&key);
        if let Some(limit) = cut {
            served.truncate(limit);
        }

        let mut chunks: Vec<Result<Bytes, TransportError>> = served
            .chunks(CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if cut.is_some() {
            chunks.push(Err(TransportError::Other("connection reset".to_string())));
        }

        Ok(Download {
            offset: start as u64,
            stream: futures::stream::iter(chunks).boxed(),
        })
    }
}

/// Holds every request until [`GatedTransport::release`] is called.
#[derive(Clone)]
pub struct GatedTransport {
    pub inner: MemoryTransport,
    gate: Arc<Semaphore>,
    pub entered: Arc<Notify>,
}

impl GatedTransport {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(0)),
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1 << 20);
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn open(&self, url: &Url, offset: u64) -> Result<Download, TransportError> {
        self.entered.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| TransportError::Other(err.to_string()))?;
        permit.forget();
        self.inner.open(url, offset).await
    }
}

pub fn metadata_url(name: &str) -> String {
    format!("{METADATA_URL}{name}")
}

pub fn target_url(path: &str) -> String {
    format!("{TARGET_URL}{path}")
}

pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn target(path: &str, body: &[u8]) -> TargetFile {
    TargetFile {
        path: path.to_string(),
        length: body.len() as u64,
        sha256: digest(body),
    }
}

fn signed<T: serde::Serialize>(payload: &T, keys: &[&SigningKey]) -> Vec<u8> {
    SignedEnvelope::sign(payload, keys).unwrap().to_vec().unwrap()
}

/// A release authority publishing into a [`MemoryTransport`].
pub struct Repo {
    pub transport: MemoryTransport,
    pub root_key: SigningKey,
    pub timestamp_key: SigningKey,
    pub snapshot_key: SigningKey,
    pub targets_key: SigningKey,
    /// Bundled root shipped with the application.
    pub initial_root: Vec<u8>,
    root_version: u64,
    timestamp_version: u64,
    snapshot_version: u64,
    releases: BTreeMap<String, ReleaseDocument>,
}

impl Repo {
    pub fn new() -> Self {
        let mut repo = Self {
            transport: MemoryTransport::default(),
            root_key: SigningKey::from_bytes(&[11u8; 32]),
            timestamp_key: SigningKey::from_bytes(&[12u8; 32]),
            snapshot_key: SigningKey::from_bytes(&[13u8; 32]),
            targets_key: SigningKey::from_bytes(&[14u8; 32]),
            initial_root: Vec::new(),
            root_version: 1,
            timestamp_version: 0,
            snapshot_version: 0,
            releases: BTreeMap::new(),
        };
        let root = repo.root_document(1);
        repo.initial_root = signed(&root, &[&repo.root_key]);
        repo
    }

    pub fn root_document(&self, version: u64) -> RootMetadata {
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for (role, key) in [
            (Role::Root, &self.root_key),
            (Role::Timestamp, &self.timestamp_key),
            (Role::Snapshot, &self.snapshot_key),
            (Role::Targets, &self.targets_key),
        ] {
            let verifying = key.verifying_key();
            keys.insert(key_id(&verifying), encode_public_key(&verifying));
            roles.insert(
                role,
                RoleKeys {
                    keyids: vec![key_id(&verifying)],
                    threshold: 1,
                },
            );
        }
        RootMetadata {
            kind: Role::Root,
            version,
            expires: Utc::now() + Duration::days(365),
            keys,
            roles,
        }
    }

    /// Upload the files of a release and register its targets document.
    pub fn add_release(&mut self, version: &str, files: &[(&str, &str)]) -> &mut ReleaseDocument {
        let mut targets = Vec::new();
        for (path, body) in files {
            self.transport.put(&target_url(path), body.as_bytes().to_vec());
            targets.push(target(path, body.as_bytes()));
        }
        let document = ReleaseDocument {
            kind: Role::Targets,
            version: 1,
            expires: Utc::now() + Duration::days(30),
            release: version.to_string(),
            prerelease: false,
            targets,
            custom: BTreeMap::new(),
            release_notes: None,
        };
        self.releases
            .entry(format!("releases/{version}.json"))
            .or_insert(document)
    }

    /// Attach release notes to an already registered release.
    pub fn add_release_notes(&mut self, version: &str, text: &str) {
        let path = format!("notes/{version}.txt");
        self.transport.put(&target_url(&path), text.as_bytes().to_vec());
        let document = self
            .releases
            .get_mut(&format!("releases/{version}.json"))
            .unwrap();
        document.release_notes = Some(target(&path, text.as_bytes()));
    }

    /// Sign and upload new snapshot and timestamp documents covering every
    /// registered release. Returns the timestamp bytes.
    pub fn publish(&mut self) -> Vec<u8> {
        self.snapshot_version += 1;
        self.timestamp_version += 1;
        self.publish_documents(Utc::now() + Duration::days(7))
    }

    /// Re-sign the current timestamp version with different content.
    pub fn republish_same_timestamp(&mut self) -> Vec<u8> {
        self.publish_documents(Utc::now() + Duration::days(8))
    }

    fn publish_documents(&mut self, timestamp_expires: chrono::DateTime<Utc>) -> Vec<u8> {
        let mut meta = BTreeMap::new();
        for (name, document) in &self.releases {
            let bytes = signed(document, &[&self.targets_key]);
            meta.insert(
                name.clone(),
                MetaFileInfo {
                    version: document.version,
                    length: Some(bytes.len() as u64),
                    sha256: Some(digest(&bytes)),
                },
            );
            self.transport.put(&metadata_url(name), bytes);
        }

        let snapshot = SnapshotMetadata {
            kind: Role::Snapshot,
            version: self.snapshot_version,
            expires: Utc::now() + Duration::days(7),
            meta,
        };
        let snapshot_bytes = signed(&snapshot, &[&self.snapshot_key]);

        let timestamp = TimestampMetadata {
            kind: Role::Timestamp,
            version: self.timestamp_version,
            expires: timestamp_expires,
            snapshot: MetaFileInfo {
                version: snapshot.version,
                length: Some(snapshot_bytes.len() as u64),
                sha256: Some(digest(&snapshot_bytes)),
            },
        };
        let timestamp_bytes = signed(&timestamp, &[&self.timestamp_key]);

        self.transport.put(&metadata_url("snapshot.json"), snapshot_bytes);
        self.transport
            .put(&metadata_url("timestamp.json"), timestamp_bytes.clone());
        timestamp_bytes
    }

    /// Publish `<n>.root.json` handing the root role to `new_key`, signed by
    /// both the outgoing and the incoming key.
    pub fn rotate_root(&mut self, new_key: SigningKey) -> u64 {
        let old_key = self.root_key.clone();
        self.root_key = new_key;
        self.root_version += 1;
        let root = self.root_document(self.root_version);
        let bytes = signed(&root, &[&old_key, &self.root_key]);
        self.transport
            .put(&metadata_url(&format!("{}.root.json", self.root_version)), bytes);
        self.root_version
    }
}

pub fn config(dir: &Path) -> UpdaterConfig {
    UpdaterConfig {
        app_name: "demo".to_string(),
        install_dir: dir.join("app"),
        data_dir: dir.join("data"),
        current_version: "1.0.0".to_string(),
        metadata_base_url: METADATA_URL.to_string(),
        target_base_url: TARGET_URL.to_string(),
        retry: RetryPolicy::immediate(3),
        target_attempts: 3,
        progress_interval_ms: 0,
        ..UpdaterConfig::default()
    }
}

pub fn builder(config: UpdaterConfig, repo: &Repo) -> UpdateClientBuilder {
    UpdateClient::builder(config)
        .bootstrap_root(repo.initial_root.clone())
        .with_transport(repo.transport.clone())
        .with_confirmation(AutoApprove)
}

pub fn client(config: UpdaterConfig, repo: &Repo) -> UpdateClient {
    builder(config, repo).build().unwrap()
}

pub fn write(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}
