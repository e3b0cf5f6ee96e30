//! Host-facing update client and its phase state machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use crate::apply::{
    ApplyOutcome, ApplyRequest, ConfirmationHandler, DeclineAll, Recovery, UpdateApplier,
};
use crate::cancel::CancelHandle;
use crate::config::UpdaterConfig;
use crate::download::{FetchSettings, TargetFetcher};
use crate::error::{ClientPhase, Result, UpdateError};
use crate::metadata::{ReleaseMetadata, TargetFile};
use crate::progress::{NoProgress, ProgressHook};
use crate::purge::PurgePlan;
use crate::resolver::{MetadataResolver, ResolverSettings};
use crate::selector::VersionSelector;
use crate::transport::{HttpTransport, Transport};
use crate::trust::TrustStore;
use crate::version::{Channel, ReleaseVersion};

/// The release selected by the last successful check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCandidate {
    release: ReleaseMetadata,
}

impl UpdateCandidate {
    pub fn version(&self) -> &ReleaseVersion {
        &self.release.version
    }

    pub fn is_prerelease(&self) -> bool {
        self.release.is_prerelease
    }

    pub fn targets(&self) -> &[TargetFile] {
        &self.release.targets
    }

    pub fn custom(&self) -> &std::collections::BTreeMap<String, serde_json::Value> {
        &self.release.custom
    }

    /// Human-readable change list published with the release.
    pub fn changes(&self) -> Vec<String> {
        self.release.changes()
    }

    /// Bytes that applying this candidate will download.
    pub fn total_length(&self) -> u64 {
        self.release.total_length()
    }

    pub fn release(&self) -> &ReleaseMetadata {
        &self.release
    }
}

impl From<ReleaseMetadata> for UpdateCandidate {
    fn from(release: ReleaseMetadata) -> Self {
        Self { release }
    }
}

#[derive(Debug)]
struct ClientState {
    phase: ClientPhase,
    candidate: Option<UpdateCandidate>,
    installed: ReleaseVersion,
}

/// Restores the phase when an operation ends, however it ends.
struct PhaseGuard<'a> {
    client: &'a UpdateClient,
    settle: ClientPhase,
}

impl PhaseGuard<'_> {
    fn settle(&mut self, phase: ClientPhase) {
        self.settle = phase;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.client.cancel.disarm();
        let mut state = self.client.state();
        state.phase = self.settle;
        if self.settle == ClientPhase::Idle {
            state.candidate = None;
        }
    }
}

/// Builder for [`UpdateClient`].
pub struct UpdateClientBuilder {
    config: UpdaterConfig,
    bootstrap_root: Option<Vec<u8>>,
    transport: Option<Arc<dyn Transport>>,
    progress: Arc<dyn ProgressHook>,
    confirmation: Arc<dyn ConfirmationHandler>,
}

impl UpdateClientBuilder {
    /// Pinned root document shipped with the application. Only consulted when
    /// no root has been cached yet.
    pub fn bootstrap_root(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.bootstrap_root = Some(bytes.into());
        self
    }

    /// Replace the default HTTP transport.
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn with_progress_hook(mut self, hook: impl ProgressHook + 'static) -> Self {
        self.progress = Arc::new(hook);
        self
    }

    /// Without a handler every update is declined unless the request skips
    /// confirmation.
    pub fn with_confirmation(mut self, handler: impl ConfirmationHandler + 'static) -> Self {
        self.confirmation = Arc::new(handler);
        self
    }

    /// Prepare the data directory, recover from an interrupted apply and
    /// establish the root of trust.
    pub fn build(self) -> Result<UpdateClient> {
        let config = self.config;
        config.ensure_dirs()?;
        let configured = config.parsed_current_version()?;

        let applier = UpdateApplier::new(&config);
        match applier.recover()? {
            Recovery::Clean => {}
            Recovery::RolledBack => warn!("an interrupted update was rolled back"),
            Recovery::RolledForward => info!("an interrupted update was completed"),
        }

        let mut trust = TrustStore::open(&config.metadata_dir())?;
        trust.bootstrap(self.bootstrap_root.as_deref())?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::builder()
                    .request_timeout(config.request_timeout())
                    .user_agent(format!("{}-updater/{}", config.app_name, configured))
                    .build()
                    .map_err(|err| UpdateError::Config(format!("http client: {err}")))?,
            ),
        };

        let cancel = CancelHandle::new();
        let resolver = MetadataResolver::new(
            transport.clone(),
            trust,
            ResolverSettings {
                metadata_base_url: config.metadata_url()?,
                target_base_url: config.target_url()?,
                cache_dir: config.metadata_dir().join("cache"),
                retry: config.retry.clone(),
                max_metadata_bytes: config.max_metadata_bytes,
                max_root_rotations: config.max_root_rotations,
            },
            cancel.clone(),
        );
        let fetcher = TargetFetcher::new(
            transport,
            FetchSettings {
                target_base_url: config.target_url()?,
                target_dir: config.target_dir(),
                retry: config.retry.clone(),
                attempts: config.target_attempts,
                progress_interval: config.progress_interval(),
                fetch_timeout: config.fetch_timeout(),
            },
        );

        let installed = match applier.installed_marker() {
            Some(marker) if marker > configured => marker,
            _ => configured,
        };
        info!(app = %config.app_name, version = %installed, "update client ready");

        Ok(UpdateClient {
            config,
            state: Mutex::new(ClientState {
                phase: ClientPhase::Idle,
                candidate: None,
                installed,
            }),
            resolver: tokio::sync::Mutex::new(resolver),
            fetcher,
            applier,
            progress: self.progress,
            confirmation: self.confirmation,
            cancel,
        })
    }
}

/// Checks for, downloads and applies verified updates on behalf of the host.
///
/// One update flow runs at a time: calls that arrive while a check or an
/// apply is in progress fail with [`UpdateError::InvalidState`].
pub struct UpdateClient {
    config: UpdaterConfig,
    state: Mutex<ClientState>,
    resolver: tokio::sync::Mutex<MetadataResolver>,
    fetcher: TargetFetcher,
    applier: UpdateApplier,
    progress: Arc<dyn ProgressHook>,
    confirmation: Arc<dyn ConfirmationHandler>,
    cancel: CancelHandle,
}

impl UpdateClient {
    pub fn builder(config: UpdaterConfig) -> UpdateClientBuilder {
        UpdateClientBuilder {
            config,
            bootstrap_root: None,
            transport: None,
            progress: Arc::new(NoProgress),
            confirmation: Arc::new(DeclineAll),
        }
    }

    /// Client with the default HTTP transport, no progress output and a
    /// confirmation handler that declines.
    pub fn new(config: UpdaterConfig, bootstrap_root: Option<&[u8]>) -> Result<Self> {
        let mut builder = Self::builder(config);
        if let Some(bytes) = bootstrap_root {
            builder = builder.bootstrap_root(bytes);
        }
        builder.build()
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn phase(&self) -> ClientPhase {
        self.state().phase
    }

    /// The newer of the configured version and the last applied one.
    pub fn installed_version(&self) -> ReleaseVersion {
        self.state().installed.clone()
    }

    /// Candidate held while the client is ready to apply.
    pub fn candidate(&self) -> Option<UpdateCandidate> {
        self.state().candidate.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Look for a release newer than the installed version.
    ///
    /// `channel` of `None` considers stable releases only. `Ok(None)` means
    /// the installed version is current. A found candidate moves the client
    /// to [`ClientPhase::ReadyToApply`]; checking again replaces it.
    pub async fn check_for_updates(&self, channel: Option<Channel>) -> Result<Option<UpdateCandidate>> {
        let mut guard = self.enter(
            "check_for_updates",
            &[ClientPhase::Idle, ClientPhase::ReadyToApply],
            ClientPhase::Checking,
        )?;

        let releases = {
            let mut resolver = self.resolver.lock().await;
            resolver.resolve().await
        };
        let releases = releases.map_err(|err| report("metadata check", err))?;

        let installed = self.installed_version();
        let Some(release) = VersionSelector::select(&releases, &installed, channel) else {
            info!(installed = %installed, channel = ?channel, "no newer release available");
            return Ok(None);
        };

        let candidate = UpdateCandidate::from(release);
        info!(
            installed = %installed,
            candidate = %candidate.version(),
            bytes = candidate.total_length(),
            "update available"
        );
        self.state().candidate = Some(candidate.clone());
        guard.settle(ClientPhase::ReadyToApply);
        Ok(Some(candidate))
    }

    /// Download the current candidate, confirm with the host and apply it.
    ///
    /// Valid only after a check found a candidate. The client returns to
    /// [`ClientPhase::Idle`] whether this succeeds or fails.
    pub async fn download_and_apply_update(&self, request: ApplyRequest) -> Result<ApplyOutcome> {
        const OPERATION: &str = "download_and_apply_update";
        let _guard = self.enter(OPERATION, &[ClientPhase::ReadyToApply], ClientPhase::Applying)?;
        let candidate = self
            .state()
            .candidate
            .take()
            .ok_or(UpdateError::InvalidState {
                operation: OPERATION,
                phase: ClientPhase::Applying,
            })?;

        let staged = self
            .fetcher
            .fetch(candidate.release(), self.progress.as_ref(), &self.cancel)
            .await
            .map_err(|err| report("download", err))?;

        let previous = self.installed_version();
        let outcome = self
            .applier
            .apply(
                staged,
                &request,
                &candidate,
                &previous,
                self.confirmation.as_ref(),
                &self.cancel,
            )
            .await
            .map_err(|err| report("apply", err))?;

        self.state().installed = outcome.new_version.clone();
        Ok(outcome)
    }

    /// Verified release notes for `candidate`, if it publishes any.
    pub async fn release_notes(&self, candidate: &UpdateCandidate) -> Result<Option<String>> {
        let resolver = self.resolver.lock().await;
        resolver.fetch_release_notes(candidate.release()).await
    }

    /// Dry run of a purge with the given exclusions.
    pub fn plan_purge(&self, exclude_from_purge: &[std::path::PathBuf]) -> Result<PurgePlan> {
        Ok(self.applier.plan(exclude_from_purge)?)
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(
        &self,
        operation: &'static str,
        allowed: &[ClientPhase],
        next: ClientPhase,
    ) -> Result<PhaseGuard<'_>> {
        let mut state = self.state();
        if !allowed.contains(&state.phase) {
            return Err(UpdateError::InvalidState {
                operation,
                phase: state.phase,
            });
        }
        state.phase = next;
        drop(state);

        self.cancel.arm();
        Ok(PhaseGuard {
            client: self,
            settle: ClientPhase::Idle,
        })
    }
}

fn report(stage: &'static str, err: UpdateError) -> UpdateError {
    if err.indicates_tampering() {
        error!(stage, error = %err, "update channel failed verification");
    } else if err.is_unavailable() {
        warn!(stage, error = %err, "update server unavailable, keeping current version");
    } else if !matches!(err, UpdateError::Cancelled) {
        warn!(stage, error = %err, "update failed");
    }
    err
}
