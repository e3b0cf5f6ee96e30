//! Applying a verified release to the install directory.
//!
//! The new tree is assembled next to the install directory and swapped in
//! with two renames. A journal written before the swap lets [`UpdateApplier::recover`]
//! finish or undo an apply that was interrupted by a crash, so the install
//! directory always holds either the previous or the new version in full.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::{extract_zip, is_zip};
use crate::cancel::CancelHandle;
use crate::client::UpdateCandidate;
use crate::config::UpdaterConfig;
use crate::download::StagedRelease;
use crate::error::{ApplyError, Result, UpdateError};
use crate::install_log::{InstallLog, InstallRecord, InstalledTarget};
use crate::persist::write_atomic;
use crate::purge::{plan_purge, DirSnapshot, EntryKind, ExclusionSet, PurgePlan};
use crate::version::ReleaseVersion;

/// How the host wants a release applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyRequest {
    /// Remove everything in the install directory that is not excluded before
    /// installing. Irreversible for non-excluded content.
    pub purge: bool,
    /// Paths relative to the install directory (or absolute paths inside it)
    /// that are neither purged nor overwritten.
    pub exclude_from_purge: Vec<PathBuf>,
    /// Apply without asking the [`ConfirmationHandler`].
    pub skip_confirmation: bool,
}

/// Asks the host whether a downloaded release may be installed.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, candidate: &UpdateCandidate) -> bool;
}

/// Declines every update. Used when the host did not install a handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclineAll;

#[async_trait]
impl ConfirmationHandler for DeclineAll {
    async fn confirm(&self, _candidate: &UpdateCandidate) -> bool {
        false
    }
}

/// Approves every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationHandler for AutoApprove {
    async fn confirm(&self, _candidate: &UpdateCandidate) -> bool {
        true
    }
}

/// Result of a completed apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub previous_version: ReleaseVersion,
    pub new_version: ReleaseVersion,
    pub install_dir: PathBuf,
    /// Files written from the release, relative to the install directory.
    pub installed: Vec<PathBuf>,
    /// Entries removed by the purge, relative to the install directory.
    pub purged: Vec<PathBuf>,
}

/// What [`UpdateApplier::recover`] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No interrupted apply.
    Clean,
    /// The swap had not happened; the previous tree was kept.
    RolledBack,
    /// The swap had happened; the bookkeeping was completed.
    RolledForward,
}

/// Written before the swap, removed once the apply is fully recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ApplyJournal {
    pub staging_dir: PathBuf,
    pub previous_dir: PathBuf,
    pub record: InstallRecord,
}

#[derive(Debug, Clone)]
struct Layout {
    install_dir: PathBuf,
    staging_dir: PathBuf,
    previous_dir: PathBuf,
    journal: PathBuf,
    marker: PathBuf,
    log: InstallLog,
}

pub struct UpdateApplier {
    install_dir: PathBuf,
    journal: PathBuf,
    marker: PathBuf,
    log: InstallLog,
}

impl UpdateApplier {
    pub fn new(config: &UpdaterConfig) -> Self {
        Self {
            install_dir: config.install_dir.clone(),
            journal: config.journal_path(),
            marker: config.version_marker_path(),
            log: InstallLog::new(config.install_log_path()),
        }
    }

    pub fn install_log(&self) -> &InstallLog {
        &self.log
    }

    /// Version recorded by the last completed apply, if any.
    pub fn installed_marker(&self) -> Option<ReleaseVersion> {
        let raw = fs::read_to_string(&self.marker).ok()?;
        match raw.trim().parse() {
            Ok(version) => Some(version),
            Err(err) => {
                warn!(path = %self.marker.display(), error = %err, "ignoring unreadable version marker");
                None
            }
        }
    }

    /// Dry run: what a purge with these exclusions would remove right now.
    pub fn plan(&self, exclude_from_purge: &[PathBuf]) -> std::result::Result<PurgePlan, ApplyError> {
        let exclusions = ExclusionSet::new(&self.install_dir, exclude_from_purge)?;
        let snapshot = DirSnapshot::capture(&self.install_dir)
            .map_err(|err| ApplyError::io("scan install directory", &self.install_dir, err))?;
        Ok(plan_purge(&snapshot, &exclusions))
    }

    /// Confirm with the host, then install `staged` into the install directory.
    ///
    /// Declining leaves the filesystem untouched. Once confirmed, `cancel` is
    /// locked and the filesystem phase runs to completion on a blocking thread.
    pub async fn apply(
        &self,
        staged: StagedRelease,
        request: &ApplyRequest,
        candidate: &UpdateCandidate,
        previous_version: &ReleaseVersion,
        confirm: &dyn ConfirmationHandler,
        cancel: &CancelHandle,
    ) -> Result<ApplyOutcome> {
        let exclusions = ExclusionSet::new(&self.install_dir, &request.exclude_from_purge)?;

        if !request.skip_confirmation && !confirm.confirm(candidate).await {
            info!(version = %candidate.version(), "host declined the update");
            return Err(ApplyError::Declined.into());
        }
        if !cancel.lock() {
            return Err(UpdateError::Cancelled);
        }

        let layout = self.layout()?;
        let purge = request.purge;
        let previous = previous_version.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            apply_blocking(&layout, &staged, &exclusions, purge, previous)
        })
        .await
        .map_err(|err| ApplyError::Task(format!("task join error: {err}")))??;

        info!(
            from = %outcome.previous_version,
            to = %outcome.new_version,
            installed = outcome.installed.len(),
            purged = outcome.purged.len(),
            "update applied"
        );
        Ok(outcome)
    }

    /// Finish or undo an apply interrupted by a crash. Called once at start-up.
    pub fn recover(&self) -> std::result::Result<Recovery, ApplyError> {
        let layout = self.layout()?;
        recover_layout(&layout)
    }

    fn layout(&self) -> std::result::Result<Layout, ApplyError> {
        let invalid = || {
            ApplyError::io(
                "derive staging location",
                &self.install_dir,
                io::Error::new(io::ErrorKind::InvalidInput, "install directory has no parent or name"),
            )
        };
        let parent = self.install_dir.parent().ok_or_else(invalid)?;
        let name = self
            .install_dir
            .file_name()
            .ok_or_else(invalid)?
            .to_string_lossy()
            .into_owned();

        Ok(Layout {
            install_dir: self.install_dir.clone(),
            staging_dir: parent.join(format!(".{name}.update-staging")),
            previous_dir: parent.join(format!(".{name}.update-previous")),
            journal: self.journal.clone(),
            marker: self.marker.clone(),
            log: self.log.clone(),
        })
    }
}

fn apply_blocking(
    layout: &Layout,
    staged: &StagedRelease,
    exclusions: &ExclusionSet,
    purge: bool,
    previous_version: ReleaseVersion,
) -> std::result::Result<ApplyOutcome, ApplyError> {
    let snapshot = DirSnapshot::capture(&layout.install_dir)
        .map_err(|err| ApplyError::io("scan install directory", &layout.install_dir, err))?;
    let plan = if purge {
        plan_purge(&snapshot, exclusions)
    } else {
        PurgePlan::default()
    };
    if purge {
        info!(
            delete = ?plan.delete,
            keep = ?plan.keep,
            "purge plan for {}",
            layout.install_dir.display()
        );
    }

    let installed = match build_staging(layout, &snapshot, &plan, staged, exclusions) {
        Ok(installed) => installed,
        Err(err) => {
            remove_tree(&layout.staging_dir);
            return Err(err);
        }
    };

    let journal = ApplyJournal {
        staging_dir: layout.staging_dir.clone(),
        previous_dir: layout.previous_dir.clone(),
        record: InstallRecord {
            timestamp: Utc::now(),
            old_version: previous_version.to_string(),
            new_version: staged.version.to_string(),
            targets: staged
                .targets
                .iter()
                .map(|staged| InstalledTarget {
                    path: staged.target.path.clone(),
                    sha256: staged.target.sha256.to_ascii_lowercase(),
                    length: staged.target.length,
                })
                .collect(),
            purged: plan.delete.clone(),
        },
    };
    let encoded = serde_json::to_vec_pretty(&journal)?;
    if let Err(err) = write_atomic(&layout.journal, &encoded) {
        remove_tree(&layout.staging_dir);
        return Err(ApplyError::io("write apply journal", &layout.journal, err));
    }

    if let Err(err) = swap(layout) {
        abandon_swap(layout);
        return Err(err);
    }

    finish(layout, &journal)?;

    Ok(ApplyOutcome {
        previous_version,
        new_version: staged.version.clone(),
        install_dir: layout.install_dir.clone(),
        installed,
        purged: plan.delete,
    })
}

/// Assemble the new tree: surviving current content first, then the release.
fn build_staging(
    layout: &Layout,
    snapshot: &DirSnapshot,
    plan: &PurgePlan,
    staged: &StagedRelease,
    exclusions: &ExclusionSet,
) -> std::result::Result<Vec<PathBuf>, ApplyError> {
    let staging = &layout.staging_dir;
    if staging.exists() {
        fs::remove_dir_all(staging)
            .map_err(|err| ApplyError::io("remove stale staging tree", staging, err))?;
    }
    fs::create_dir_all(staging).map_err(|err| ApplyError::io("create staging tree", staging, err))?;

    for (relative, kind) in snapshot.entries() {
        if plan.removes(relative) {
            continue;
        }
        carry_over(&layout.install_dir.join(relative), &staging.join(relative), kind)?;
    }

    let mut installed = Vec::new();
    for target in &staged.targets {
        let relative = target
            .target
            .relative_path()
            .ok_or_else(|| {
                ApplyError::io(
                    "install target",
                    &target.local_path,
                    io::Error::new(io::ErrorKind::InvalidInput, "unsafe target path"),
                )
            })?;

        if is_zip(&relative) {
            let protected = |path: &Path| exclusions.protects(path);
            installed.extend(extract_zip(&target.local_path, staging, &protected)?);
            continue;
        }
        // a release file may not replace an excluded path or any of its parents
        if exclusions.protects(&relative) {
            warn!(path = %relative.display(), "release file is excluded, keeping existing content");
            continue;
        }

        let destination = staging.join(&relative);
        if destination.is_dir() {
            fs::remove_dir_all(&destination)
                .map_err(|err| ApplyError::io("replace directory", &destination, err))?;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| ApplyError::io("create directory", parent, err))?;
        }
        fs::copy(&target.local_path, &destination)
            .map_err(|err| ApplyError::io("install target", &destination, err))?;
        installed.push(relative);
    }

    debug!(
        staging = %staging.display(),
        files = installed.len(),
        "staging tree assembled"
    );
    Ok(installed)
}

fn carry_over(source: &Path, destination: &Path, kind: EntryKind) -> std::result::Result<(), ApplyError> {
    match kind {
        EntryKind::Dir => fs::create_dir_all(destination)
            .map_err(|err| ApplyError::io("create directory", destination, err)),
        EntryKind::File => fs::copy(source, destination)
            .map(|_| ())
            .map_err(|err| ApplyError::io("carry over file", source, err)),
        EntryKind::Symlink => copy_symlink(source, destination)
            .map_err(|err| ApplyError::io("carry over symlink", source, err)),
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, destination: &Path) -> io::Result<()> {
    let target = fs::read_link(source)?;
    std::os::unix::fs::symlink(target, destination)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, destination: &Path) -> io::Result<()> {
    fs::copy(source, destination).map(|_| ())
}

/// Move the current tree aside and the staging tree into place.
fn swap(layout: &Layout) -> std::result::Result<(), ApplyError> {
    if layout.previous_dir.exists() {
        fs::remove_dir_all(&layout.previous_dir)
            .map_err(|err| ApplyError::io("remove stale previous tree", &layout.previous_dir, err))?;
    }
    let had_install = layout.install_dir.exists();
    if had_install {
        fs::rename(&layout.install_dir, &layout.previous_dir)
            .map_err(|err| ApplyError::io("move install directory aside", &layout.install_dir, err))?;
    }
    if let Err(err) = fs::rename(&layout.staging_dir, &layout.install_dir) {
        if had_install {
            if let Err(restore) = fs::rename(&layout.previous_dir, &layout.install_dir) {
                warn!(error = %restore, "failed to restore previous install directory");
            }
        }
        return Err(ApplyError::io("move staging tree into place", &layout.install_dir, err));
    }
    Ok(())
}

/// Clean up after a failed swap. When the previous tree could not be put
/// back, the journal and staging tree stay for [`recover_layout`].
fn abandon_swap(layout: &Layout) {
    if !layout.install_dir.exists() {
        warn!(
            install_dir = %layout.install_dir.display(),
            "install directory missing after a failed swap, leaving it to recovery"
        );
        return;
    }
    let _ = fs::remove_file(&layout.journal);
    remove_tree(&layout.staging_dir);
}

/// Record a completed swap. Safe to run more than once for the same journal.
fn finish(layout: &Layout, journal: &ApplyJournal) -> std::result::Result<(), ApplyError> {
    write_atomic(&layout.marker, journal.record.new_version.as_bytes())
        .map_err(|err| ApplyError::io("write version marker", &layout.marker, err))?;

    let already_logged = layout.log.last_record()?.as_ref() == Some(&journal.record);
    if !already_logged {
        layout.log.append(&journal.record)?;
    }

    match fs::remove_file(&layout.journal) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(ApplyError::io("remove apply journal", &layout.journal, err)),
    }
    remove_tree(&journal.previous_dir);
    Ok(())
}

fn recover_layout(layout: &Layout) -> std::result::Result<Recovery, ApplyError> {
    let raw = match fs::read(&layout.journal) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            remove_tree(&layout.staging_dir);
            if !layout.install_dir.exists() && layout.previous_dir.exists() {
                warn!("install directory missing, restoring the previous tree");
                fs::rename(&layout.previous_dir, &layout.install_dir).map_err(|err| {
                    ApplyError::io("restore previous install directory", &layout.previous_dir, err)
                })?;
                return Ok(Recovery::RolledBack);
            }
            remove_tree(&layout.previous_dir);
            return Ok(Recovery::Clean);
        }
        Err(err) => return Err(ApplyError::io("read apply journal", &layout.journal, err)),
    };
    let journal: ApplyJournal = serde_json::from_slice(&raw)?;

    let swapped = !journal.staging_dir.exists() && layout.install_dir.exists();
    if swapped {
        warn!(
            version = %journal.record.new_version,
            "completing update interrupted after the swap"
        );
        finish(layout, &journal)?;
        return Ok(Recovery::RolledForward);
    }

    warn!(
        version = %journal.record.new_version,
        "rolling back update interrupted before the swap"
    );
    if !layout.install_dir.exists() && journal.previous_dir.exists() {
        fs::rename(&journal.previous_dir, &layout.install_dir).map_err(|err| {
            ApplyError::io("restore previous install directory", &journal.previous_dir, err)
        })?;
    }
    remove_tree(&journal.staging_dir);
    remove_tree(&journal.previous_dir);
    fs::remove_file(&layout.journal)
        .map_err(|err| ApplyError::io("remove apply journal", &layout.journal, err))?;
    Ok(Recovery::RolledBack)
}

fn remove_tree(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(err) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %err, "failed to remove leftover tree");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::StagedTarget;
    use crate::metadata::{ReleaseMetadata, TargetFile};
    use sha2::{Digest, Sha256};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _temp: tempfile::TempDir,
        config: UpdaterConfig,
        downloads: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let config = UpdaterConfig {
            install_dir: temp.path().join("app"),
            data_dir: temp.path().join("data"),
            current_version: "1.0.0".to_string(),
            ..UpdaterConfig::default()
        };
        config.ensure_dirs().unwrap();
        let downloads = temp.path().join("downloads");
        fs::create_dir_all(&downloads).unwrap();
        Fixture {
            _temp: temp,
            config,
            downloads,
        }
    }

    fn write(root: &Path, relative: &str, body: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn staged(fixture: &Fixture, version: &str, files: &[(&str, &str)]) -> StagedRelease {
        let targets = files
            .iter()
            .map(|(path, body)| {
                write(&fixture.downloads, path, body);
                StagedTarget {
                    target: TargetFile {
                        path: path.to_string(),
                        length: body.len() as u64,
                        sha256: hex::encode(Sha256::digest(body.as_bytes())),
                    },
                    local_path: fixture.downloads.join(path),
                }
            })
            .collect();
        StagedRelease {
            version: version.parse().unwrap(),
            staging_dir: fixture.downloads.clone(),
            targets,
        }
    }

    fn candidate(version: &str) -> UpdateCandidate {
        UpdateCandidate::from(ReleaseMetadata {
            version: version.parse().unwrap(),
            is_prerelease: false,
            targets: vec![],
            custom: BTreeMap::new(),
            release_notes: None,
        })
    }

    async fn run(fixture: &Fixture, release: StagedRelease, request: ApplyRequest) -> Result<ApplyOutcome> {
        let applier = UpdateApplier::new(&fixture.config);
        let version = release.version.to_string();
        applier
            .apply(
                release,
                &request,
                &candidate(&version),
                &"1.0.0".parse().unwrap(),
                &AutoApprove,
                &CancelHandle::new(),
            )
            .await
    }

    #[tokio::test]
    async fn apply_without_purge_keeps_existing_files() {
        let fixture = fixture();
        let install = &fixture.config.install_dir;
        write(install, "bin/app", "v1");
        write(install, "notes.txt", "mine");

        let release = staged(&fixture, "1.1.0", &[("bin/app", "v2"), ("lib/extra.so", "new")]);
        let outcome = run(&fixture, release, ApplyRequest::default()).await.unwrap();

        assert_eq!(outcome.new_version.to_string(), "1.1.0");
        assert!(outcome.purged.is_empty());
        assert_eq!(fs::read_to_string(install.join("bin/app")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(install.join("lib/extra.so")).unwrap(), "new");
        assert_eq!(fs::read_to_string(install.join("notes.txt")).unwrap(), "mine");

        let applier = UpdateApplier::new(&fixture.config);
        assert_eq!(applier.installed_marker().unwrap().to_string(), "1.1.0");
        let record = applier.install_log().last_record().unwrap().unwrap();
        assert_eq!(record.old_version, "1.0.0");
        assert_eq!(record.new_version, "1.1.0");
        assert_eq!(record.targets.len(), 2);
        assert!(!fixture.config.journal_path().exists());
    }

    #[tokio::test]
    async fn purge_removes_everything_but_exclusions() {
        let fixture = fixture();
        let install = &fixture.config.install_dir;
        write(install, "old.bin", "stale");
        write(install, "plugins/legacy.so", "stale");
        write(install, "user_data/profile.json", "precious");

        let release = staged(
            &fixture,
            "1.1.0",
            &[("bin/app", "v2"), ("user_data/profile.json", "factory default")],
        );
        let request = ApplyRequest {
            purge: true,
            exclude_from_purge: vec![PathBuf::from("user_data")],
            skip_confirmation: false,
        };
        let outcome = run(&fixture, release, request).await.unwrap();

        assert_eq!(outcome.purged, vec![PathBuf::from("old.bin"), PathBuf::from("plugins")]);
        assert!(!install.join("old.bin").exists());
        assert!(!install.join("plugins").exists());
        assert_eq!(fs::read_to_string(install.join("bin/app")).unwrap(), "v2");
        assert_eq!(
            fs::read_to_string(install.join("user_data/profile.json")).unwrap(),
            "precious"
        );
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ConfirmationHandler for Counting {
        async fn confirm(&self, _candidate: &UpdateCandidate) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[tokio::test]
    async fn declined_apply_changes_nothing() {
        let fixture = fixture();
        let install = &fixture.config.install_dir;
        write(install, "bin/app", "v1");

        let applier = UpdateApplier::new(&fixture.config);
        let handler = Counting(AtomicUsize::new(0));
        let cancel = CancelHandle::new();
        cancel.arm();
        let err = applier
            .apply(
                staged(&fixture, "1.1.0", &[("bin/app", "v2")]),
                &ApplyRequest {
                    purge: true,
                    ..ApplyRequest::default()
                },
                &candidate("1.1.0"),
                &"1.0.0".parse().unwrap(),
                &handler,
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Apply(ApplyError::Declined)));
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read_to_string(install.join("bin/app")).unwrap(), "v1");
        assert!(applier.installed_marker().is_none());
        assert!(applier.install_log().last_record().unwrap().is_none());
        assert!(cancel.cancel(), "handle must stay cancellable after a decline");
    }

    #[tokio::test]
    async fn invalid_exclusion_is_rejected_before_confirmation() {
        let fixture = fixture();
        let release = staged(&fixture, "1.1.0", &[("bin/app", "v2")]);
        let request = ApplyRequest {
            purge: true,
            exclude_from_purge: vec![PathBuf::from("/definitely/elsewhere")],
            skip_confirmation: true,
        };
        let err = run(&fixture, release, request).await.unwrap_err();
        assert!(matches!(err, UpdateError::Apply(ApplyError::InvalidExclusion(_))));
    }

    #[tokio::test]
    async fn zip_targets_are_extracted() {
        use std::io::Write as _;

        let fixture = fixture();
        let zip_path = fixture.downloads.join("app.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("bin/app", options).unwrap();
            writer.write_all(b"from-zip").unwrap();
            writer.finish().unwrap();
        }
        let bytes = fs::read(&zip_path).unwrap();
        let release = StagedRelease {
            version: "1.1.0".parse().unwrap(),
            staging_dir: fixture.downloads.clone(),
            targets: vec![StagedTarget {
                target: TargetFile {
                    path: "app.zip".to_string(),
                    length: bytes.len() as u64,
                    sha256: hex::encode(Sha256::digest(&bytes)),
                },
                local_path: zip_path,
            }],
        };

        let outcome = run(&fixture, release, ApplyRequest::default()).await.unwrap();
        assert_eq!(outcome.installed, vec![PathBuf::from("bin/app")]);
        assert_eq!(
            fs::read_to_string(fixture.config.install_dir.join("bin/app")).unwrap(),
            "from-zip"
        );
        assert!(!fixture.config.install_dir.join("app.zip").exists());
    }

    fn interrupted_journal(fixture: &Fixture) -> (Layout, ApplyJournal) {
        let applier = UpdateApplier::new(&fixture.config);
        let layout = applier.layout().unwrap();
        let journal = ApplyJournal {
            staging_dir: layout.staging_dir.clone(),
            previous_dir: layout.previous_dir.clone(),
            record: InstallRecord {
                timestamp: Utc::now(),
                old_version: "1.0.0".to_string(),
                new_version: "1.1.0".to_string(),
                targets: vec![],
                purged: vec![],
            },
        };
        write_atomic(&layout.journal, &serde_json::to_vec(&journal).unwrap()).unwrap();
        (layout, journal)
    }

    #[test]
    fn crash_before_swap_rolls_back() {
        let fixture = fixture();
        let (layout, _) = interrupted_journal(&fixture);
        // install moved aside, staging never renamed into place
        fs::remove_dir_all(&layout.install_dir).unwrap();
        write(&layout.previous_dir, "bin/app", "v1");
        write(&layout.staging_dir, "bin/app", "v2");

        let applier = UpdateApplier::new(&fixture.config);
        assert_eq!(applier.recover().unwrap(), Recovery::RolledBack);
        assert_eq!(
            fs::read_to_string(layout.install_dir.join("bin/app")).unwrap(),
            "v1"
        );
        assert!(!layout.staging_dir.exists());
        assert!(!layout.previous_dir.exists());
        assert!(!layout.journal.exists());
        assert!(applier.installed_marker().is_none());
        assert!(applier.install_log().last_record().unwrap().is_none());
    }

    #[test]
    fn crash_after_swap_rolls_forward_once() {
        let fixture = fixture();
        let (layout, journal) = interrupted_journal(&fixture);
        write(&layout.previous_dir, "bin/app", "v1");
        write(&layout.install_dir, "bin/app", "v2");

        let applier = UpdateApplier::new(&fixture.config);
        assert_eq!(applier.recover().unwrap(), Recovery::RolledForward);
        assert_eq!(applier.installed_marker().unwrap().to_string(), "1.1.0");
        assert_eq!(
            applier.install_log().records().unwrap(),
            vec![journal.record.clone()]
        );
        assert!(!layout.previous_dir.exists());
        assert!(!layout.journal.exists());

        // a second crash after the log append must not duplicate the record
        write_atomic(&layout.journal, &serde_json::to_vec(&journal).unwrap()).unwrap();
        assert_eq!(applier.recover().unwrap(), Recovery::RolledForward);
        assert_eq!(applier.install_log().records().unwrap().len(), 1);
        assert_eq!(
            fs::read_to_string(layout.install_dir.join("bin/app")).unwrap(),
            "v2"
        );
    }

    #[test]
    fn recover_without_journal_sweeps_leftovers() {
        let fixture = fixture();
        let applier = UpdateApplier::new(&fixture.config);
        let layout = applier.layout().unwrap();
        write(&layout.staging_dir, "half/written", "x");

        assert_eq!(applier.recover().unwrap(), Recovery::Clean);
        assert!(!layout.staging_dir.exists());
    }

    #[tokio::test]
    async fn release_file_never_replaces_a_parent_of_an_exclusion() {
        let fixture = fixture();
        let install = &fixture.config.install_dir;
        write(install, "data/user/profile.json", "precious");

        let release = staged(&fixture, "1.1.0", &[("data", "blob"), ("bin/app", "v2")]);
        let request = ApplyRequest {
            exclude_from_purge: vec![PathBuf::from("data/user")],
            ..ApplyRequest::default()
        };
        let outcome = run(&fixture, release, request).await.unwrap();

        assert_eq!(outcome.installed, vec![PathBuf::from("bin/app")]);
        assert_eq!(
            fs::read_to_string(install.join("data/user/profile.json")).unwrap(),
            "precious"
        );
        assert_eq!(fs::read_to_string(install.join("bin/app")).unwrap(), "v2");
    }

    #[tokio::test]
    async fn zip_entry_never_replaces_a_parent_of_an_exclusion() {
        use std::io::Write as _;

        let fixture = fixture();
        let install = &fixture.config.install_dir;
        write(install, "data/user/profile.json", "precious");

        let zip_path = fixture.downloads.join("app.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("data", options).unwrap();
            writer.write_all(b"blob").unwrap();
            writer.start_file("bin/app", options).unwrap();
            writer.write_all(b"from-zip").unwrap();
            writer.finish().unwrap();
        }
        let bytes = fs::read(&zip_path).unwrap();
        let release = StagedRelease {
            version: "1.1.0".parse().unwrap(),
            staging_dir: fixture.downloads.clone(),
            targets: vec![StagedTarget {
                target: TargetFile {
                    path: "app.zip".to_string(),
                    length: bytes.len() as u64,
                    sha256: hex::encode(Sha256::digest(&bytes)),
                },
                local_path: zip_path,
            }],
        };
        let request = ApplyRequest {
            exclude_from_purge: vec![PathBuf::from("data/user")],
            ..ApplyRequest::default()
        };
        let outcome = run(&fixture, release, request).await.unwrap();

        assert_eq!(outcome.installed, vec![PathBuf::from("bin/app")]);
        assert_eq!(
            fs::read_to_string(install.join("data/user/profile.json")).unwrap(),
            "precious"
        );
    }

    #[test]
    fn failed_swap_without_install_keeps_journal_for_recovery() {
        let fixture = fixture();
        let (layout, _) = interrupted_journal(&fixture);
        // install moved aside, neither rename back nor forward succeeded
        fs::remove_dir_all(&layout.install_dir).unwrap();
        write(&layout.previous_dir, "bin/app", "v1");
        write(&layout.staging_dir, "bin/app", "v2");

        abandon_swap(&layout);
        assert!(layout.journal.exists());
        assert!(layout.previous_dir.exists());

        let applier = UpdateApplier::new(&fixture.config);
        assert_eq!(applier.recover().unwrap(), Recovery::RolledBack);
        assert_eq!(
            fs::read_to_string(layout.install_dir.join("bin/app")).unwrap(),
            "v1"
        );
        assert!(!layout.journal.exists());
    }

    #[test]
    fn recover_restores_previous_tree_left_without_journal() {
        let fixture = fixture();
        let applier = UpdateApplier::new(&fixture.config);
        let layout = applier.layout().unwrap();
        fs::remove_dir_all(&layout.install_dir).unwrap();
        write(&layout.previous_dir, "bin/app", "v1");

        assert_eq!(applier.recover().unwrap(), Recovery::RolledBack);
        assert_eq!(
            fs::read_to_string(layout.install_dir.join("bin/app")).unwrap(),
            "v1"
        );
        assert!(!layout.previous_dir.exists());
    }

    #[test]
    fn failed_swap_with_install_in_place_cleans_up() {
        let fixture = fixture();
        let (layout, _) = interrupted_journal(&fixture);
        write(&layout.install_dir, "bin/app", "v1");
        write(&layout.staging_dir, "bin/app", "v2");

        abandon_swap(&layout);
        assert!(!layout.journal.exists());
        assert!(!layout.staging_dir.exists());
        assert_eq!(
            fs::read_to_string(layout.install_dir.join("bin/app")).unwrap(),
            "v1"
        );
    }

    #[test]
    fn dry_run_plan_reports_without_deleting() {
        let fixture = fixture();
        let install = &fixture.config.install_dir;
        write(install, "old.bin", "stale");
        write(install, "user_data/profile.json", "precious");

        let applier = UpdateApplier::new(&fixture.config);
        let plan = applier.plan(&[PathBuf::from("user_data")]).unwrap();
        assert_eq!(plan.delete, vec![PathBuf::from("old.bin")]);
        assert!(install.join("old.bin").exists());
    }
}
