//! Local root of trust: bootstrapping from a pinned copy and rotating through
//! signed successors.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::TrustError;
use crate::metadata::{Role, RootMetadata};
use crate::persist::write_atomic;
use crate::signature::SignedEnvelope;

const ROOT_FILE: &str = "root.json";
const HISTORY_DIR: &str = "root_history";

/// Owns the adopted root document and its on-disk history.
#[derive(Debug)]
pub struct TrustStore {
    dir: PathBuf,
    root: Option<RootMetadata>,
}

impl TrustStore {
    /// Open the trust cache under `metadata_dir`, loading the adopted root if
    /// one was persisted earlier.
    pub fn open(metadata_dir: &Path) -> Result<Self, TrustError> {
        let path = metadata_dir.join(ROOT_FILE);
        let root = if path.exists() {
            let raw = fs::read(&path).map_err(|source| TrustError::Cache {
                context: "read",
                path: path.clone(),
                source,
            })?;
            // written only after verification, so only the shape is rechecked
            let envelope = SignedEnvelope::from_slice(&raw)
                .map_err(|err| TrustError::Malformed(err.to_string()))?;
            let root: RootMetadata = envelope
                .decode()
                .map_err(|err| TrustError::Malformed(err.to_string()))?;
            Some(root)
        } else {
            None
        };

        Ok(Self {
            dir: metadata_dir.to_path_buf(),
            root,
        })
    }

    /// Ensure a root is adopted. A cached root always wins over the bundled
    /// copy; without either, bootstrapping fails.
    pub fn bootstrap(&mut self, initial_root: Option<&[u8]>) -> Result<(), TrustError> {
        if let Some(root) = &self.root {
            info!(version = root.version, "using cached trusted root");
            return Ok(());
        }
        let Some(bytes) = initial_root else {
            return Err(TrustError::Bootstrap(
                "no cached root and no bundled root supplied".to_string(),
            ));
        };

        let envelope = SignedEnvelope::from_slice(bytes)
            .map_err(|err| TrustError::Bootstrap(format!("bundled root: {err}")))?;
        let root: RootMetadata = envelope
            .decode()
            .map_err(|err| TrustError::Bootstrap(format!("bundled root: {err}")))?;
        envelope
            .verify_role(&root, Role::Root)
            .map_err(|err| TrustError::Bootstrap(format!("bundled root is not self-signed: {err}")))?;

        self.persist(&root, bytes)?;
        info!(version = root.version, "trusted root bootstrapped from bundled copy");
        self.root = Some(root);
        Ok(())
    }

    /// The currently adopted root.
    pub fn root(&self) -> Result<&RootMetadata, TrustError> {
        self.root
            .as_ref()
            .ok_or_else(|| TrustError::Bootstrap("trust store has not been bootstrapped".to_string()))
    }

    /// Verify `candidate` as the immediate successor of the adopted root and
    /// adopt it. Nothing changes on failure.
    pub fn verify_and_adopt(&mut self, candidate: &[u8]) -> Result<&RootMetadata, TrustError> {
        self.verify_and_adopt_at(candidate, Utc::now())
    }

    pub(crate) fn verify_and_adopt_at(
        &mut self,
        candidate: &[u8],
        now: DateTime<Utc>,
    ) -> Result<&RootMetadata, TrustError> {
        let current = self.root()?;
        let envelope =
            SignedEnvelope::from_slice(candidate).map_err(|err| TrustError::Malformed(err.to_string()))?;
        let next: RootMetadata = envelope
            .decode()
            .map_err(|err| TrustError::Malformed(err.to_string()))?;

        if next.version <= current.version {
            return Err(TrustError::Rollback {
                trusted: current.version,
                candidate: next.version,
            });
        }
        if next.version != current.version + 1 {
            return Err(TrustError::VersionSkip {
                trusted: current.version,
                candidate: next.version,
            });
        }

        // signed by the keys we already trust, and by its own new key set
        envelope
            .verify_role(current, Role::Root)
            .map_err(|source| TrustError::Signature {
                version: next.version,
                source,
            })?;
        envelope
            .verify_role(&next, Role::Root)
            .map_err(|source| TrustError::Signature {
                version: next.version,
                source,
            })?;

        if next.expires <= now {
            return Err(TrustError::Expired {
                version: next.version,
                expires: next.expires,
            });
        }

        self.persist(&next, candidate)?;
        info!(
            from = current.version,
            to = next.version,
            "rotated trusted root"
        );
        Ok(self.root.insert(next))
    }

    fn persist(&self, root: &RootMetadata, bytes: &[u8]) -> Result<(), TrustError> {
        let history = self
            .dir
            .join(HISTORY_DIR)
            .join(format!("{}.root.json", root.version));
        if history.exists() {
            warn!(path = %history.display(), "overwriting existing root history entry");
        }
        write_atomic(&history, bytes).map_err(|source| TrustError::Cache {
            context: "write",
            path: history.clone(),
            source,
        })?;

        let current = self.dir.join(ROOT_FILE);
        write_atomic(&current, bytes).map_err(|source| TrustError::Cache {
            context: "write",
            path: current,
            source,
        })
    }
}
