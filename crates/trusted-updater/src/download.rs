//! Streamed, resumable and digest-verified target downloads.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cancel::CancelHandle;
use crate::config::RetryPolicy;
use crate::error::{Result, TargetError, TransportError, UpdateError};
use crate::metadata::{ReleaseMetadata, TargetFile};
use crate::progress::{ProgressHook, ThrottledProgress};
use crate::transport::Transport;
use crate::version::ReleaseVersion;

/// A verified target on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTarget {
    pub target: TargetFile,
    pub local_path: PathBuf,
}

/// Every target of a release, downloaded and verified.
#[derive(Debug, Clone)]
pub struct StagedRelease {
    pub version: ReleaseVersion,
    pub staging_dir: PathBuf,
    pub targets: Vec<StagedTarget>,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub target_base_url: Url,
    /// Verified downloads land in `<target_dir>/<version>/<path>`.
    pub target_dir: PathBuf,
    pub retry: RetryPolicy,
    pub attempts: u32,
    pub progress_interval: Duration,
    pub fetch_timeout: Duration,
}

/// Why a single download attempt stopped.
enum AttemptError {
    /// Network trouble; the part file is kept so the next attempt can resume.
    Transport(TransportError),
    /// The server sent more bytes than declared.
    Oversize(u64),
    /// Disk failure or cancellation; abort the whole fetch.
    Fatal(UpdateError),
}

/// A failed attempt that may be retried.
enum Retry {
    /// The completed file does not match its declared length or digest.
    Integrity(String),
    Transport(TransportError),
}

impl From<TargetError> for AttemptError {
    fn from(err: TargetError) -> Self {
        AttemptError::Fatal(err.into())
    }
}

pub struct TargetFetcher {
    transport: Arc<dyn Transport>,
    settings: FetchSettings,
}

impl TargetFetcher {
    pub fn new(transport: Arc<dyn Transport>, settings: FetchSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Download and verify every target of `release`.
    pub async fn fetch(
        &self,
        release: &ReleaseMetadata,
        progress: &dyn ProgressHook,
        cancel: &CancelHandle,
    ) -> Result<StagedRelease> {
        let budget = self.settings.fetch_timeout;
        match tokio::time::timeout(budget, self.fetch_all(release, progress, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(TargetError::Timeout(budget).into()),
        }
    }

    async fn fetch_all(
        &self,
        release: &ReleaseMetadata,
        progress: &dyn ProgressHook,
        cancel: &CancelHandle,
    ) -> Result<StagedRelease> {
        let staging_dir = self.settings.target_dir.join(release.version.to_string());
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|err| TargetError::io("create staging directory", &staging_dir, err))?;

        let mut throttle = ThrottledProgress::new(
            progress,
            self.settings.progress_interval,
            release.total_length(),
        );
        let mut completed = 0u64;
        let mut staged = Vec::with_capacity(release.targets.len());

        for target in &release.targets {
            check_cancelled(cancel)?;
            let relative = target
                .relative_path()
                .ok_or_else(|| TargetError::UnsafePath(target.path.clone()))?;
            let final_path = staging_dir.join(relative);

            self.fetch_target(target, &final_path, completed, &mut throttle, cancel)
                .await?;
            completed += target.length;
            staged.push(StagedTarget {
                target: target.clone(),
                local_path: final_path,
            });
        }
        throttle.finish(completed);

        info!(
            version = %release.version,
            targets = staged.len(),
            bytes = completed,
            "all targets downloaded and verified"
        );
        Ok(StagedRelease {
            version: release.version.clone(),
            staging_dir,
            targets: staged,
        })
    }

    async fn fetch_target(
        &self,
        target: &TargetFile,
        final_path: &Path,
        base: u64,
        throttle: &mut ThrottledProgress<'_>,
        cancel: &CancelHandle,
    ) -> Result<()> {
        if final_path.exists() {
            if verify_file(final_path, target).await?.is_none() {
                debug!(path = %target.path, "target already staged");
                throttle.report(base + target.length);
                return Ok(());
            }
            tokio::fs::remove_file(final_path)
                .await
                .map_err(|err| TargetError::io("remove stale target", final_path, err))?;
        }
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| TargetError::io("create target directory", parent, err))?;
        }

        let url = self
            .settings
            .target_base_url
            .join(&target.path)
            .map_err(|_| TargetError::UnsafePath(target.path.clone()))?;
        let part = part_path(final_path);
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            check_cancelled(cancel)?;
            let delay = self.settings.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let failure = match self
                .download_once(&url, target, &part, base, throttle, cancel)
                .await
            {
                Ok(()) => match verify_file(&part, target).await? {
                    None => {
                        tokio::fs::rename(&part, final_path)
                            .await
                            .map_err(|err| TargetError::io("finalise target", final_path, err))?;
                        debug!(path = %target.path, attempt, "target verified");
                        return Ok(());
                    }
                    Some(actual) => Retry::Integrity(actual),
                },
                Err(AttemptError::Oversize(received)) => {
                    Retry::Integrity(format!("more than {received} bytes"))
                }
                Err(AttemptError::Transport(source)) => Retry::Transport(source),
                Err(AttemptError::Fatal(err)) => return Err(err),
            };

            match failure {
                Retry::Integrity(actual) => {
                    discard(&part).await?;
                    warn!(path = %target.path, attempt, %actual, "target failed verification");
                    if attempt >= attempts {
                        return Err(TargetError::Integrity {
                            path: target.path.clone(),
                            expected: describe(target.length, &target.sha256),
                            actual,
                        }
                        .into());
                    }
                }
                Retry::Transport(source) => {
                    warn!(path = %target.path, attempt, error = %source, "target download interrupted");
                    if attempt >= attempts {
                        return Err(TargetError::Fetch {
                            path: target.path.clone(),
                            attempts,
                            source,
                        }
                        .into());
                    }
                }
            }
        }
    }

    /// Stream one attempt into the part file, resuming from whatever a
    /// previous attempt left behind.
    async fn download_once(
        &self,
        url: &Url,
        target: &TargetFile,
        part: &Path,
        base: u64,
        throttle: &mut ThrottledProgress<'_>,
        cancel: &CancelHandle,
    ) -> std::result::Result<(), AttemptError> {
        let mut existing = match tokio::fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if existing > target.length {
            discard(part).await.map_err(AttemptError::Fatal)?;
            existing = 0;
        }
        if existing == target.length && existing > 0 {
            return Ok(());
        }

        let mut download = self
            .transport
            .open(url, existing)
            .await
            .map_err(AttemptError::Transport)?;

        let resumed = existing > 0 && download.offset == existing;
        if !resumed && download.offset != 0 {
            return Err(AttemptError::Transport(TransportError::Other(format!(
                "{url} resumed at unexpected offset {}",
                download.offset
            ))));
        }

        let opened = if resumed {
            debug!(path = %target.path, offset = existing, "resuming partial download");
            tokio::fs::OpenOptions::new().append(true).open(part).await
        } else {
            tokio::fs::File::create(part).await
        };
        let mut file = opened.map_err(|err| TargetError::io("open part file", part, err))?;

        let mut written = if resumed { existing } else { 0 };
        throttle.report(base + written);

        while let Some(chunk) = download.stream.next().await {
            if cancel.is_cancelled() {
                file.flush()
                    .await
                    .map_err(|err| TargetError::io("flush part file", part, err))?;
                return Err(AttemptError::Fatal(UpdateError::Cancelled));
            }
            let chunk = chunk.map_err(AttemptError::Transport)?;
            if written + chunk.len() as u64 > target.length {
                return Err(AttemptError::Oversize(target.length));
            }
            file.write_all(&chunk)
                .await
                .map_err(|err| TargetError::io("write part file", part, err))?;
            written += chunk.len() as u64;
            throttle.report(base + written);
        }

        file.flush()
            .await
            .map_err(|err| TargetError::io("flush part file", part, err))?;
        file.sync_all()
            .await
            .map_err(|err| TargetError::io("sync part file", part, err))?;

        if written < target.length {
            return Err(AttemptError::Transport(TransportError::Truncated {
                url: url.to_string(),
                received: written,
                expected: target.length,
            }));
        }
        Ok(())
    }
}

fn check_cancelled(cancel: &CancelHandle) -> Result<()> {
    if cancel.is_cancelled() {
        Err(UpdateError::Cancelled)
    } else {
        Ok(())
    }
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

fn describe(length: u64, sha256: &str) -> String {
    format!("{length} bytes, sha256 {}", sha256.to_ascii_lowercase())
}

async fn discard(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TargetError::io("remove part file", path, err).into()),
    }
}

/// `None` when `path` matches the target exactly, otherwise a description of
/// what was found.
async fn verify_file(path: &Path, target: &TargetFile) -> Result<Option<String>> {
    let owned = path.to_path_buf();
    let (length, digest) = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|err| TargetError::io("hash target", path, std::io::Error::other(err.to_string())))?
        .map_err(|err| TargetError::io("hash target", path, err))?;

    if length == target.length && digest.eq_ignore_ascii_case(&target.sha256) {
        Ok(None)
    } else {
        Ok(Some(describe(length, &digest)))
    }
}

pub(crate) fn sha256_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    let mut length = 0u64;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        length += read as u64;
    }

    Ok((length, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/targets/1.0.0/app.zip")),
            PathBuf::from("/tmp/targets/1.0.0/app.zip.part")
        );
    }

    #[test]
    fn sha256_file_returns_known_digest() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("payload.bin");
        std::fs::write(&path, b"versi").unwrap();

        let (length, digest) = sha256_file(&path).unwrap();
        assert_eq!(length, 5);
        assert_eq!(digest, hex::encode(Sha256::digest(b"versi")));
    }

    #[tokio::test]
    async fn any_altered_byte_fails_verification() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("payload.bin");
        let original = b"release payload bytes".to_vec();
        let target = TargetFile {
            path: "payload.bin".to_string(),
            length: original.len() as u64,
            sha256: hex::encode(Sha256::digest(&original)),
        };

        std::fs::write(&path, &original).unwrap();
        assert!(verify_file(&path, &target).await.unwrap().is_none());

        for index in 0..original.len() {
            let mut altered = original.clone();
            altered[index] ^= 0x01;
            std::fs::write(&path, &altered).unwrap();
            assert!(verify_file(&path, &target).await.unwrap().is_some());
        }
    }
}
