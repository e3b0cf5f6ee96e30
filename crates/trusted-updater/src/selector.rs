use tracing::debug;

use crate::metadata::ReleaseMetadata;
use crate::version::{Channel, ReleaseVersion, Tier};

/// Chooses the single best release to offer.
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionSelector;

impl VersionSelector {
    /// Highest release strictly newer than `current` that the channel admits.
    /// `None` is a normal outcome, not an error.
    pub fn select(
        releases: &[ReleaseMetadata],
        current: &ReleaseVersion,
        channel: Option<Channel>,
    ) -> Option<ReleaseMetadata> {
        let min_tier = channel.map_or(Tier::Stable, Channel::min_tier);

        releases
            .iter()
            .filter(|release| release.version > *current)
            .filter(|release| match effective_tier(release) {
                Some(tier) => tier >= min_tier,
                None => {
                    debug!(version = %release.version, "skipping release with unrecognised pre-release label");
                    false
                }
            })
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned()
    }
}

/// A release flagged as pre-release without a tier label counts as the least
/// stable tier.
fn effective_tier(release: &ReleaseMetadata) -> Option<Tier> {
    match release.version.tier()? {
        Tier::Stable if release.is_prerelease => Some(Tier::Alpha),
        tier => Some(tier),
    }
}
