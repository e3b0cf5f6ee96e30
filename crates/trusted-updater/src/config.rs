use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};
use crate::version::ReleaseVersion;

const DEFAULT_METADATA_URL: &str = "http://localhost:8000/metadata/";
const DEFAULT_TARGET_URL: &str = "http://localhost:8000/targets/";

/// Bounded exponential backoff for network fetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Policy without any sleeping between attempts, for tests and tools.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before attempt `attempt` (1-based; the first attempt never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Everything the host supplies to construct an [`crate::UpdateClient`].
///
/// The host owns this value; nothing is read from ambient process state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdaterConfig {
    pub app_name: String,
    /// Live application directory that updates are applied to.
    pub install_dir: PathBuf,
    /// Root for the metadata cache, target cache, version marker and install log.
    pub data_dir: PathBuf,
    /// Version of the running application.
    pub current_version: String,
    pub metadata_base_url: String,
    pub target_base_url: String,
    pub retry: RetryPolicy,
    /// Attempts per target, counting integrity failures and network failures.
    pub target_attempts: u32,
    /// Longest wait for a connection, response headers or the next body chunk.
    pub request_timeout_secs: u64,
    /// Deadline for downloading every target of a release.
    pub fetch_timeout_secs: u64,
    /// Minimum spacing between progress callbacks.
    pub progress_interval_ms: u64,
    /// Upper bound for any metadata document whose length is not declared.
    pub max_metadata_bytes: u64,
    pub max_root_rotations: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            install_dir: PathBuf::from("target/app/install"),
            data_dir: PathBuf::from("target/app/update-data"),
            current_version: "0.0.0".to_string(),
            metadata_base_url: DEFAULT_METADATA_URL.to_string(),
            target_base_url: DEFAULT_TARGET_URL.to_string(),
            retry: RetryPolicy::default(),
            target_attempts: 3,
            request_timeout_secs: 30,
            fetch_timeout_secs: 30 * 60,
            progress_interval_ms: 200,
            max_metadata_bytes: 1024 * 1024,
            max_root_rotations: 32,
        }
    }
}

impl UpdaterConfig {
    /// Load a JSON configuration file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|err| {
            UpdateError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|err| UpdateError::Config(format!("cannot parse {}: {err}", path.display())))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.install_dir.clone(), self.metadata_dir(), self.target_dir()] {
            std::fs::create_dir_all(&dir).map_err(|err| {
                UpdateError::Config(format!("cannot create {}: {err}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Trust roots and verified metadata documents.
    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// Verified (and in-progress) target downloads.
    pub fn target_dir(&self) -> PathBuf {
        self.data_dir.join("targets")
    }

    pub fn install_log_path(&self) -> PathBuf {
        self.data_dir.join("install.log")
    }

    pub fn version_marker_path(&self) -> PathBuf {
        self.data_dir.join("current_version")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("apply-journal.json")
    }

    pub fn parsed_current_version(&self) -> Result<ReleaseVersion> {
        self.current_version
            .parse()
            .map_err(|err| UpdateError::Config(format!("current_version: {err}")))
    }

    pub fn metadata_url(&self) -> Result<Url> {
        parse_base_url("metadata_base_url", &self.metadata_base_url)
    }

    pub fn target_url(&self) -> Result<Url> {
        parse_base_url("target_base_url", &self.target_base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Base URLs are joined with relative document paths, so they must end in `/`.
fn parse_base_url(field: &str, raw: &str) -> Result<Url> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|err| UpdateError::Config(format!("{field}: {err}")))
}
