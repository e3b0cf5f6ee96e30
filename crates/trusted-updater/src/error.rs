use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::metadata::Role;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Top-level error returned by [`crate::UpdateClient`] operations.
///
/// None of these variants is fatal to the running application: the host keeps
/// running its current, still-trusted version and may retry later.
#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    /// Bootstrapping or rotating the root of trust failed.
    #[error(transparent)]
    Trust(#[from] TrustError),
    /// Release metadata could not be resolved or failed verification.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// A target could not be downloaded or failed verification.
    #[error(transparent)]
    Target(#[from] TargetError),
    /// Applying staged content to the install directory failed or was declined.
    #[error(transparent)]
    Apply(#[from] ApplyError),
    /// The operation is not valid in the client's current phase.
    #[error("cannot {operation} while the client is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: ClientPhase,
    },
    /// The host cancelled the update cycle.
    #[error("update cancelled")]
    Cancelled,
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl UpdateError {
    /// Metadata could not be fetched after retries; the host should treat
    /// this as "no update right now".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, UpdateError::Metadata(MetadataError::Unavailable { .. }))
    }

    /// Failures that may indicate an attack on the update channel. These are
    /// never retried with the same documents.
    pub fn indicates_tampering(&self) -> bool {
        match self {
            UpdateError::Trust(err) => !matches!(err, TrustError::Bootstrap(_) | TrustError::Cache { .. }),
            UpdateError::Metadata(err) => !matches!(
                err,
                MetadataError::Unavailable { .. } | MetadataError::Cache { .. }
            ),
            UpdateError::Target(TargetError::Integrity { .. }) => true,
            _ => false,
        }
    }
}

/// Phase of the [`crate::UpdateClient`] state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Checking,
    ReadyToApply,
    Applying,
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientPhase::Idle => "idle",
            ClientPhase::Checking => "checking for updates",
            ClientPhase::ReadyToApply => "ready to apply",
            ClientPhase::Applying => "applying an update",
        };
        f.write_str(label)
    }
}

/// Reasons a set of signatures does not satisfy a role.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("role {0} is not defined by the trusted root")]
    UnknownRole(Role),
    #[error("expected a {expected} document, found {found:?}")]
    WrongType { expected: Role, found: String },
    #[error("{valid} valid signature(s) for role {role}, threshold is {threshold}")]
    BelowThreshold {
        role: Role,
        valid: usize,
        threshold: u32,
    },
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Failures while bootstrapping or rotating the root of trust.
#[derive(thiserror::Error, Debug)]
pub enum TrustError {
    /// No cached root exists and no bootstrap copy was supplied (or it was unusable).
    #[error("no trusted root available: {0}")]
    Bootstrap(String),
    /// The candidate root is not newer than the adopted one.
    #[error("root rollback rejected: candidate version {candidate} does not follow trusted version {trusted}")]
    Rollback { trusted: u64, candidate: u64 },
    /// The candidate root skips one or more versions.
    #[error("root version skip rejected: trusted version {trusted}, candidate version {candidate}")]
    VersionSkip { trusted: u64, candidate: u64 },
    /// The candidate root is not signed by enough trusted keys.
    #[error("root version {version} rejected: {source}")]
    Signature {
        version: u64,
        #[source]
        source: SignatureError,
    },
    /// The candidate root has already expired.
    #[error("root version {version} expired at {expires}")]
    Expired { version: u64, expires: DateTime<Utc> },
    /// The candidate root could not be decoded.
    #[error("malformed root document: {0}")]
    Malformed(String),
    /// Reading or writing the trust cache failed.
    #[error("trust cache {context} failed at {}: {source}", path.display())]
    Cache {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while resolving release metadata.
#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    /// Signature, type, length, hash or version-consistency failure.
    #[error("{document} failed verification: {reason}")]
    Integrity { document: String, reason: String },
    /// The document's expiry lies in the past.
    #[error("{document} expired at {expires}")]
    Expired {
        document: String,
        expires: DateTime<Utc>,
    },
    /// The document's version regressed below the trusted baseline.
    #[error("{document} rollback rejected: trusted version {trusted}, offered version {offered}")]
    Rollback {
        document: String,
        trusted: u64,
        offered: u64,
    },
    /// The document could not be fetched after all retry attempts.
    #[error("{document} unavailable after {attempts} attempt(s): {source}")]
    Unavailable {
        document: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// Reading or writing the metadata cache failed.
    #[error("metadata cache {context} failed at {}: {source}", path.display())]
    Cache {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MetadataError {
    pub(crate) fn integrity(document: impl Into<String>, reason: impl Into<String>) -> Self {
        MetadataError::Integrity {
            document: document.into(),
            reason: reason.into(),
        }
    }
}

/// Failures while downloading targets.
#[derive(thiserror::Error, Debug)]
pub enum TargetError {
    /// The downloaded bytes do not match the declared length or digest.
    #[error("target {path} failed verification: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },
    /// The target could not be downloaded after all retry attempts.
    #[error("target {path} could not be fetched after {attempts} attempt(s): {source}")]
    Fetch {
        path: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// Local disk failure (space, permissions) while staging.
    #[error("{context} failed at {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The target path escapes the staging directory.
    #[error("target path {0:?} is not a safe relative path")]
    UnsafePath(String),
    /// The whole fetch exceeded its time budget.
    #[error("fetching targets exceeded {0:?}")]
    Timeout(std::time::Duration),
}

impl TargetError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TargetError::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

/// Failures while applying staged content.
#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    /// The host declined the confirmation prompt; nothing was changed.
    #[error("update declined by host")]
    Declined,
    /// An exclusion path is not inside the install directory.
    #[error("exclusion path {} is not inside the install directory", .0.display())]
    InvalidExclusion(PathBuf),
    /// A filesystem operation failed.
    #[error("{context} failed at {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// An archive target could not be extracted.
    #[error("failed to extract {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    /// The apply journal could not be encoded or decoded.
    #[error("apply journal is unreadable: {0}")]
    Journal(#[from] serde_json::Error),
    /// The blocking apply task panicked or was cancelled.
    #[error("apply task failed: {0}")]
    Task(String),
}

impl ApplyError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ApplyError::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

/// Transport-level failures, shared by metadata and target fetches.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The server does not have the requested resource.
    #[error("{url} not found")]
    NotFound { url: String },
    /// The server answered with an unexpected status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    /// The response exceeded the permitted size.
    #[error("{url} exceeded the {limit}-byte limit")]
    TooLarge { url: String, limit: u64 },
    /// The connection failed or was interrupted.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The stream ended before the expected number of bytes arrived.
    #[error("{url} ended after {received} of {expected} bytes")]
    Truncated {
        url: String,
        received: u64,
        expected: u64,
    },
    /// No response, or no body data, arrived within the idle timeout.
    #[error("{url} stalled for more than {idle:?}")]
    Stalled { url: String, idle: std::time::Duration },
    /// Any other transport failure (used by custom transports).
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}
