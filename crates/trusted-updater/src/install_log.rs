use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ApplyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledTarget {
    pub path: String,
    pub sha256: String,
    pub length: u64,
}

/// One applied update, stored as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRecord {
    pub timestamp: DateTime<Utc>,
    pub old_version: String,
    pub new_version: String,
    pub targets: Vec<InstalledTarget>,
    /// Entries removed by the purge, relative to the install directory.
    #[serde(default)]
    pub purged: Vec<PathBuf>,
}

/// Append-only record of applied updates.
#[derive(Debug, Clone)]
pub struct InstallLog {
    path: PathBuf,
}

impl InstallLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &InstallRecord) -> Result<(), ApplyError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| ApplyError::io("open install log", &self.path, err))?;
        file.write_all(&line)
            .and_then(|()| file.sync_all())
            .map_err(|err| ApplyError::io("append install log", &self.path, err))
    }

    /// All readable records, oldest first. A torn trailing line from an
    /// interrupted append is skipped.
    pub fn records(&self) -> Result<Vec<InstallRecord>, ApplyError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ApplyError::io("read install log", &self.path, err)),
        };

        let mut records = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(line = index + 1, error = %err, "skipping unreadable install log line"),
            }
        }
        Ok(records)
    }

    pub fn last_record(&self) -> Result<Option<InstallRecord>, ApplyError> {
        Ok(self.records()?.pop())
    }
}
