//! Application update client anchored to a threshold-signed root of trust.
//!
//! Release authorities publish signed metadata next to the release files: a
//! root document naming the keys trusted for each role, a short-lived
//! timestamp, a snapshot listing every per-release document, and the release
//! documents themselves with the length and SHA-256 of every target file.
//! The client walks that chain, rejecting anything that is unsigned,
//! expired, older than what it has already seen or inconsistent with its
//! parent document. It then picks the best newer release for the requested
//! channel, downloads and verifies its files, and swaps them into the
//! install directory so that a crash leaves either the old or the new
//! version in place.
//!
//! ```ignore
//! use trusted_updater::{ApplyRequest, Channel, UpdateClient, UpdaterConfig};
//!
//! # async fn demo() -> trusted_updater::Result<()> {
//! let config = UpdaterConfig::from_json_file("updater.json".as_ref())?;
//! let client = UpdateClient::builder(config)
//!     .bootstrap_root(include_bytes!("../root.json").to_vec())
//!     .with_progress_hook(|done: u64, total: u64| println!("{done}/{total}"))
//!     .build()?;
//!
//! match client.check_for_updates(None).await {
//!     Ok(Some(candidate)) => {
//!         println!("updating to {}", candidate.version());
//!         client
//!             .download_and_apply_update(ApplyRequest {
//!                 skip_confirmation: true,
//!                 ..ApplyRequest::default()
//!             })
//!             .await?;
//!     }
//!     Ok(None) => println!("already at latest version"),
//!     Err(err) if err.is_unavailable() => println!("update server unreachable"),
//!     Err(err) => return Err(err),
//! }
//! # let _ = Channel::Beta;
//! # Ok(())
//! # }
//! ```

mod apply;
mod archive;
mod cancel;
mod client;
mod config;
mod download;
mod error;
mod install_log;
mod metadata;
mod persist;
mod progress;
mod purge;
mod resolver;
mod selector;
mod signature;
mod transport;
mod trust;
mod version;

pub use apply::{
    ApplyOutcome, ApplyRequest, AutoApprove, ConfirmationHandler, DeclineAll, Recovery,
    UpdateApplier,
};
pub use cancel::CancelHandle;
pub use client::{UpdateCandidate, UpdateClient, UpdateClientBuilder};
pub use config::{RetryPolicy, UpdaterConfig};
pub use download::{FetchSettings, StagedRelease, StagedTarget, TargetFetcher};
pub use error::{
    ApplyError, ClientPhase, MetadataError, Result, SignatureError, TargetError, TransportError,
    TrustError, UpdateError,
};
pub use install_log::{InstallLog, InstallRecord, InstalledTarget};
pub use metadata::{
    MetaFileInfo, ReleaseDocument, ReleaseMetadata, Role, RoleDocument, RoleKeys, RootMetadata,
    SnapshotMetadata, TargetFile, TimestampMetadata,
};
pub use progress::{ChannelProgress, NoProgress, ProgressEvent, ProgressHook};
pub use purge::{plan_purge, DirSnapshot, EntryKind, ExclusionSet, PurgePlan};
pub use resolver::{MetadataResolver, ResolverSettings};
pub use selector::VersionSelector;
pub use signature::{encode_public_key, key_id, EnvelopeSignature, SignedEnvelope};
pub use transport::{ByteStream, Download, HttpTransport, HttpTransportBuilder, Transport};
pub use trust::TrustStore;
pub use version::{Channel, ReleaseVersion, Tier, VersionError};
