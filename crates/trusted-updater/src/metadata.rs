//! Signed document models consumed by the client.
//!
//! Every document travels inside a [`crate::signature::SignedEnvelope`]; the
//! types here describe the `signed` payload once its signatures have been
//! checked.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::ReleaseVersion;

/// Metadata roles defined by a root document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Timestamp,
    Snapshot,
    Targets,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Timestamp => "timestamp",
            Role::Snapshot => "snapshot",
            Role::Targets => "targets",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common accessors shared by all signed payloads.
pub trait RoleDocument: serde::de::DeserializeOwned {
    const ROLE: Role;

    fn version(&self) -> u64;
    fn expires(&self) -> DateTime<Utc>;
}

/// Keys and threshold assigned to one role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

/// Root-of-trust document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootMetadata {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// Key id (hex SHA-256 of the public key) to hex-encoded ed25519 public key.
    pub keys: BTreeMap<String, String>,
    pub roles: BTreeMap<Role, RoleKeys>,
}

impl RoleDocument for RootMetadata {
    const ROLE: Role = Role::Root;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Version (and optionally length and digest) a parent document declares for a child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaFileInfo {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Short-lived document pointing at the current snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampMetadata {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub snapshot: MetaFileInfo,
}

impl RoleDocument for TimestampMetadata {
    const ROLE: Role = Role::Timestamp;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Consistent view of every release document currently published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFileInfo>,
}

impl RoleDocument for SnapshotMetadata {
    const ROLE: Role = Role::Snapshot;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// A downloadable file referenced by a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetFile {
    /// Path relative to the target base URL and to the install directory.
    pub path: String,
    pub length: u64,
    /// Lowercase hex SHA-256 digest.
    pub sha256: String,
}

impl TargetFile {
    /// The target path as a relative filesystem path, or `None` if it could
    /// escape the directory it is joined onto.
    pub fn relative_path(&self) -> Option<PathBuf> {
        safe_relative_path(&self.path)
    }
}

/// Per-release targets document, signed by the `targets` role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseDocument {
    #[serde(rename = "_type")]
    pub kind: Role,
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// Application version this document describes.
    pub release: String,
    #[serde(default)]
    pub prerelease: bool,
    pub targets: Vec<TargetFile>,
    #[serde(default)]
    pub custom: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<TargetFile>,
}

impl RoleDocument for ReleaseDocument {
    const ROLE: Role = Role::Targets;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Verified description of one published application version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseMetadata {
    pub version: ReleaseVersion,
    pub is_prerelease: bool,
    pub targets: Vec<TargetFile>,
    pub custom: BTreeMap<String, serde_json::Value>,
    pub release_notes: Option<TargetFile>,
}

impl ReleaseMetadata {
    /// Total number of bytes across all targets.
    pub fn total_length(&self) -> u64 {
        self.targets.iter().map(|target| target.length).sum()
    }

    /// The `changes` annotation, if the release authority provided one.
    pub fn changes(&self) -> Vec<String> {
        self.custom
            .get("changes")
            .and_then(|value| value.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Rejects absolute paths, `..` components and empty paths.
pub(crate) fn safe_relative_path(raw: &str) -> Option<PathBuf> {
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}
