//! Delegated-trust metadata resolution.
//!
//! Each document is verified against the current root before the next one is
//! trusted: root rotations first, then `timestamp.json`, the `snapshot.json`
//! it points at, and finally every per-release document the snapshot lists.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cancel::CancelHandle;
use crate::config::RetryPolicy;
use crate::error::{MetadataError, Result, TargetError, TransportError, UpdateError};
use crate::metadata::{
    safe_relative_path, MetaFileInfo, ReleaseDocument, ReleaseMetadata, Role, RoleDocument,
    SnapshotMetadata, TargetFile, TimestampMetadata,
};
use crate::persist::write_atomic;
use crate::signature::SignedEnvelope;
use crate::transport::Transport;
use crate::trust::TrustStore;
use crate::version::ReleaseVersion;

const TIMESTAMP: &str = "timestamp.json";
const SNAPSHOT: &str = "snapshot.json";
const RELEASE_PREFIX: &str = "targets";

/// Last trusted copy of a document: its version and exact bytes.
#[derive(Debug, Clone)]
struct Baseline {
    version: u64,
    bytes: Vec<u8>,
}

/// Settings the resolver needs from [`crate::UpdaterConfig`].
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub metadata_base_url: Url,
    pub target_base_url: Url,
    pub cache_dir: PathBuf,
    pub retry: RetryPolicy,
    pub max_metadata_bytes: u64,
    pub max_root_rotations: u32,
}

/// Fetches and verifies release metadata.
pub struct MetadataResolver {
    transport: Arc<dyn Transport>,
    trust: TrustStore,
    settings: ResolverSettings,
    cancel: CancelHandle,
    /// Documents consumed so far, seeded lazily from the on-disk cache.
    baselines: HashMap<String, Baseline>,
}

impl MetadataResolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        trust: TrustStore,
        settings: ResolverSettings,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            transport,
            trust,
            settings,
            cancel,
            baselines: HashMap::new(),
        }
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Resolve every currently published release.
    pub async fn resolve(&mut self) -> Result<Vec<ReleaseMetadata>> {
        let now = Utc::now();
        self.update_root(now).await?;

        let root = self.trust.root()?;
        if root.expires <= now {
            return Err(MetadataError::Expired {
                document: "root.json".to_string(),
                expires: root.expires,
            }
            .into());
        }

        let raw = self.require(TIMESTAMP, None).await?;
        let timestamp: TimestampMetadata = self.verify_document(TIMESTAMP, &raw, None, now)?;
        self.commit(TIMESTAMP, raw, timestamp.version)?;

        let previous_snapshot = self.trusted_copy::<SnapshotMetadata>(SNAPSHOT)?;
        let raw = self.require(SNAPSHOT, Some(&timestamp.snapshot)).await?;
        let snapshot: SnapshotMetadata =
            self.verify_document(SNAPSHOT, &raw, Some(&timestamp.snapshot), now)?;
        if let Some(previous) = previous_snapshot {
            check_snapshot_regression(&previous, &snapshot)?;
        }
        self.commit(SNAPSHOT, raw, snapshot.version)?;

        let mut releases = Vec::with_capacity(snapshot.meta.len());
        for (name, info) in &snapshot.meta {
            self.check_cancelled()?;
            let document = self.resolve_release(name, info, now).await?;
            releases.push(document);
        }

        info!(
            timestamp = timestamp.version,
            snapshot = snapshot.version,
            releases = releases.len(),
            "release metadata resolved"
        );
        Ok(releases)
    }

    /// Fetch and verify the release's out-of-band notes, if it has any.
    pub async fn fetch_release_notes(&self, release: &ReleaseMetadata) -> Result<Option<String>> {
        let Some(notes) = &release.release_notes else {
            return Ok(None);
        };
        let url = join_url(&self.settings.target_base_url, &notes.path)
            .ok_or_else(|| TargetError::UnsafePath(notes.path.clone()))?;
        let bytes = match self.fetch_with_retry(&url, &notes.path, notes.length).await? {
            Some(bytes) => bytes,
            None => {
                return Err(TargetError::Fetch {
                    path: notes.path.clone(),
                    attempts: 1,
                    source: TransportError::NotFound {
                        url: url.to_string(),
                    },
                }
                .into())
            }
        };

        let actual = hex::encode(Sha256::digest(&bytes));
        if bytes.len() as u64 != notes.length || !actual.eq_ignore_ascii_case(&notes.sha256) {
            return Err(TargetError::Integrity {
                path: notes.path.clone(),
                expected: format!("{} bytes, sha256 {}", notes.length, notes.sha256),
                actual: format!("{} bytes, sha256 {actual}", bytes.len()),
            }
            .into());
        }
        String::from_utf8(bytes).map(Some).map_err(|_| {
            TargetError::Integrity {
                path: notes.path.clone(),
                expected: "utf-8 text".to_string(),
                actual: "invalid utf-8".to_string(),
            }
            .into()
        })
    }

    async fn update_root(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut rotated = false;
        for _ in 0..self.settings.max_root_rotations {
            self.check_cancelled()?;
            let next_version = self.trust.root()?.version + 1;
            let name = format!("{next_version}.root.json");
            let url = self.document_url(&name)?;
            match self
                .fetch_with_retry(&url, &name, self.settings.max_metadata_bytes)
                .await?
            {
                Some(bytes) => {
                    self.trust.verify_and_adopt_at(&bytes, now)?;
                    rotated = true;
                }
                None => break,
            }
        }

        if rotated {
            // baselines are re-seeded and re-verified under the new keys
            self.baselines.clear();
        }
        Ok(())
    }

    async fn resolve_release(
        &mut self,
        name: &str,
        info: &MetaFileInfo,
        now: DateTime<Utc>,
    ) -> Result<ReleaseMetadata> {
        let relative = safe_relative_path(name)
            .ok_or_else(|| MetadataError::integrity(name, "unsafe document name"))?;
        let key = format!("{RELEASE_PREFIX}/{}", relative.display());

        let cached = self.baseline(&key, Role::Targets)?;
        let raw = match cached {
            Some(baseline) if baseline.version == info.version => {
                debug!(document = name, version = info.version, "using cached release document");
                baseline.bytes
            }
            _ => self.require(name, Some(info)).await?,
        };

        let document: ReleaseDocument = self.verify_document(&key, &raw, Some(info), now)?;
        self.commit(&key, raw, document.version)?;
        release_from_document(name, document)
    }

    /// Check length, hash, signatures, declared version, rollback and expiry.
    fn verify_document<T: RoleDocument>(
        &mut self,
        key: &str,
        raw: &[u8],
        declared: Option<&MetaFileInfo>,
        now: DateTime<Utc>,
    ) -> std::result::Result<T, MetadataError> {
        if let Some(declared) = declared {
            check_declared_hashes(key, raw, declared)?;
        }

        let envelope =
            SignedEnvelope::from_slice(raw).map_err(|err| MetadataError::integrity(key, err.to_string()))?;
        let root = self
            .trust
            .root()
            .map_err(|err| MetadataError::integrity(key, err.to_string()))?;
        let document: T = envelope
            .verify_as(root)
            .map_err(|err| MetadataError::integrity(key, err.to_string()))?;

        if let Some(declared) = declared {
            if document.version() != declared.version {
                return Err(MetadataError::integrity(
                    key,
                    format!(
                        "version {} does not match declared version {}",
                        document.version(),
                        declared.version
                    ),
                ));
            }
        }

        if let Some(baseline) = self.baseline(key, T::ROLE)? {
            if document.version() < baseline.version
                || (document.version() == baseline.version && raw != baseline.bytes.as_slice())
            {
                return Err(MetadataError::Rollback {
                    document: key.to_string(),
                    trusted: baseline.version,
                    offered: document.version(),
                });
            }
        }

        if document.expires() <= now {
            return Err(MetadataError::Expired {
                document: key.to_string(),
                expires: document.expires(),
            });
        }
        Ok(document)
    }

    /// Persist a verified document and make it the session baseline.
    fn commit(&mut self, key: &str, raw: Vec<u8>, version: u64) -> std::result::Result<(), MetadataError> {
        let unchanged = self
            .baselines
            .get(key)
            .is_some_and(|baseline| baseline.version == version && baseline.bytes == raw);
        if !unchanged {
            let path = self.cache_path(key);
            write_atomic(&path, &raw).map_err(|source| MetadataError::Cache {
                context: "write",
                path,
                source,
            })?;
            debug!(document = key, version, "cached verified document");
        }
        self.baselines
            .insert(key.to_string(), Baseline { version, bytes: raw });
        Ok(())
    }

    /// Session baseline for `key`, seeded from the cache. A cached copy that
    /// no longer verifies under the current root is discarded.
    fn baseline(&mut self, key: &str, role: Role) -> std::result::Result<Option<Baseline>, MetadataError> {
        if let Some(baseline) = self.baselines.get(key) {
            return Ok(Some(baseline.clone()));
        }

        let path = self.cache_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|source| MetadataError::Cache {
            context: "read",
            path: path.clone(),
            source,
        })?;

        let root = self
            .trust
            .root()
            .map_err(|err| MetadataError::integrity(key, err.to_string()))?;
        let verified = SignedEnvelope::from_slice(&bytes).and_then(|envelope| {
            envelope.verify_role(root, role)?;
            envelope
                .signed
                .get("version")
                .and_then(|value| value.as_u64())
                .ok_or_else(|| crate::error::SignatureError::Malformed("missing version".to_string()))
        });

        match verified {
            Ok(version) => {
                let baseline = Baseline { version, bytes };
                self.baselines.insert(key.to_string(), baseline.clone());
                Ok(Some(baseline))
            }
            Err(err) => {
                warn!(document = key, error = %err, "discarding cached document that no longer verifies");
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "failed to remove stale cache entry");
                }
                Ok(None)
            }
        }
    }

    fn trusted_copy<T: RoleDocument>(&mut self, key: &str) -> std::result::Result<Option<T>, MetadataError> {
        let Some(baseline) = self.baseline(key, T::ROLE)? else {
            return Ok(None);
        };
        let envelope = SignedEnvelope::from_slice(&baseline.bytes)
            .map_err(|err| MetadataError::integrity(key, err.to_string()))?;
        envelope
            .decode()
            .map(Some)
            .map_err(|err| MetadataError::integrity(key, err.to_string()))
    }

    /// Fetch a document that must exist.
    async fn require(&self, name: &str, declared: Option<&MetaFileInfo>) -> Result<Vec<u8>> {
        let url = self.document_url(name)?;
        let limit = declared
            .and_then(|info| info.length)
            .unwrap_or(self.settings.max_metadata_bytes);
        match self.fetch_with_retry(&url, name, limit).await? {
            Some(bytes) => Ok(bytes),
            None => Err(MetadataError::Unavailable {
                document: name.to_string(),
                attempts: 1,
                source: TransportError::NotFound {
                    url: url.to_string(),
                },
            }
            .into()),
        }
    }

    /// Fetch with bounded exponential backoff. `Ok(None)` means the server
    /// reported the resource as missing, which is never retried.
    async fn fetch_with_retry(&self, url: &Url, name: &str, limit: u64) -> Result<Option<Vec<u8>>> {
        let attempts = self.settings.retry.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.check_cancelled()?;
            let delay = self.settings.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.transport.fetch_bytes(url, limit).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(err) if err.is_not_found() => return Ok(None),
                Err(TransportError::TooLarge { limit, .. }) => {
                    return Err(MetadataError::integrity(name, format!("larger than {limit} bytes")).into())
                }
                Err(source) if attempt >= attempts => {
                    warn!(document = name, attempts, error = %source, "giving up on document");
                    return Err(MetadataError::Unavailable {
                        document: name.to_string(),
                        attempts,
                        source,
                    }
                    .into());
                }
                Err(err) => {
                    debug!(document = name, attempt, error = %err, "fetch failed, retrying");
                }
            }
        }
    }

    fn document_url(&self, name: &str) -> Result<Url> {
        join_url(&self.settings.metadata_base_url, name)
            .ok_or_else(|| MetadataError::integrity(name, "cannot form document url").into())
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.settings.cache_dir.join(key)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn join_url(base: &Url, path: &str) -> Option<Url> {
    safe_relative_path(path)?;
    base.join(path).ok()
}

fn check_declared_hashes(
    key: &str,
    raw: &[u8],
    declared: &MetaFileInfo,
) -> std::result::Result<(), MetadataError> {
    if let Some(length) = declared.length {
        if raw.len() as u64 != length {
            return Err(MetadataError::integrity(
                key,
                format!("length {} does not match declared length {length}", raw.len()),
            ));
        }
    }
    if let Some(expected) = &declared.sha256 {
        let actual = hex::encode(Sha256::digest(raw));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(MetadataError::integrity(
                key,
                format!("sha256 {actual} does not match declared {expected}"),
            ));
        }
    }
    Ok(())
}

/// A newer snapshot may drop release documents but never lower their versions.
fn check_snapshot_regression(
    previous: &SnapshotMetadata,
    next: &SnapshotMetadata,
) -> std::result::Result<(), MetadataError> {
    for (name, old) in &previous.meta {
        match next.meta.get(name) {
            Some(new) if new.version < old.version => {
                return Err(MetadataError::Rollback {
                    document: name.clone(),
                    trusted: old.version,
                    offered: new.version,
                });
            }
            Some(_) => {}
            None => debug!(document = %name, "release document withdrawn from snapshot"),
        }
    }
    Ok(())
}

fn release_from_document(name: &str, document: ReleaseDocument) -> Result<ReleaseMetadata> {
    let version: ReleaseVersion = document
        .release
        .parse()
        .map_err(|err| MetadataError::integrity(name, format!("{err}")))?;

    for target in document.targets.iter().chain(document.release_notes.iter()) {
        check_target_entry(name, target)?;
    }

    Ok(ReleaseMetadata {
        is_prerelease: document.prerelease || version.is_prerelease(),
        version,
        targets: document.targets,
        custom: document.custom,
        release_notes: document.release_notes,
    })
}

fn check_target_entry(name: &str, target: &TargetFile) -> Result<()> {
    if target.relative_path().is_none() {
        return Err(MetadataError::integrity(name, format!("unsafe target path {:?}", target.path)).into());
    }
    let valid_digest = target.sha256.len() == 64 && target.sha256.bytes().all(|b| b.is_ascii_hexdigit());
    if !valid_digest {
        return Err(MetadataError::integrity(
            name,
            format!("target {} has a malformed sha256 digest", target.path),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn snapshot(entries: &[(&str, u64)]) -> SnapshotMetadata {
        SnapshotMetadata {
            kind: Role::Snapshot,
            version: 1,
            expires: Utc::now() + Duration::days(1),
            meta: entries
                .iter()
                .map(|(name, version)| {
                    (
                        name.to_string(),
                        MetaFileInfo {
                            version: *version,
                            length: None,
                            sha256: None,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn snapshot_regression_is_a_rollback() {
        let previous = snapshot(&[("releases/1.0.0.json", 3), ("releases/1.1.0.json", 1)]);
        let lowered = snapshot(&[("releases/1.0.0.json", 2), ("releases/1.1.0.json", 1)]);
        assert!(matches!(
            check_snapshot_regression(&previous, &lowered),
            Err(MetadataError::Rollback { trusted: 3, offered: 2, .. })
        ));

        let withdrawn = snapshot(&[("releases/1.1.0.json", 2)]);
        assert!(check_snapshot_regression(&previous, &withdrawn).is_ok());
    }

    #[test]
    fn declared_length_and_hash_are_enforced() {
        let raw = b"{}";
        let info = MetaFileInfo {
            version: 1,
            length: Some(3),
            sha256: None,
        };
        assert!(check_declared_hashes("snapshot.json", raw, &info).is_err());

        let info = MetaFileInfo {
            version: 1,
            length: Some(2),
            sha256: Some(hex::encode(Sha256::digest(raw))),
        };
        assert!(check_declared_hashes("snapshot.json", raw, &info).is_ok());
    }

    #[test]
    fn release_documents_with_unsafe_targets_are_rejected() {
        let document = ReleaseDocument {
            kind: Role::Targets,
            version: 1,
            expires: Utc::now() + Duration::days(1),
            release: "1.1.0".to_string(),
            prerelease: false,
            targets: vec![TargetFile {
                path: "../escape".to_string(),
                length: 1,
                sha256: "0".repeat(64),
            }],
            custom: BTreeMap::new(),
            release_notes: None,
        };
        assert!(release_from_document("releases/1.1.0.json", document).is_err());
    }

    #[test]
    fn prerelease_flag_follows_version_label() {
        let document = ReleaseDocument {
            kind: Role::Targets,
            version: 1,
            expires: Utc::now() + Duration::days(1),
            release: "1.2.0a1".to_string(),
            prerelease: false,
            targets: vec![],
            custom: BTreeMap::new(),
            release_notes: None,
        };
        let release = release_from_document("releases/1.2.0a1.json", document).unwrap();
        assert!(release.is_prerelease);
    }
}
