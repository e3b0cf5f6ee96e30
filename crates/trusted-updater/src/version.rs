//! Release versions and pre-release channels.
//!
//! Versions are stored as [`semver::Version`] values with a canonical
//! pre-release label (`a.N`, `b.N` or `rc.N`), so semver ordering gives
//! `1.2.0-a.1 < 1.2.0-b.1 < 1.2.0-rc.1 < 1.2.0`. Both semver syntax and the
//! compact `1.2.0a1` form are accepted on input.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use semver::{BuildMetadata, Prerelease, Version};

/// Maturity tier of a release, least stable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Alpha,
    Beta,
    ReleaseCandidate,
    Stable,
}

impl Tier {
    fn from_label(label: &str) -> Option<Tier> {
        match label {
            "a" => Some(Tier::Alpha),
            "b" => Some(Tier::Beta),
            "rc" => Some(Tier::ReleaseCandidate),
            _ => None,
        }
    }
}

/// Pre-release channel a host opts into. Selecting a channel also admits
/// every more stable tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Alpha,
    Beta,
    ReleaseCandidate,
}

impl Channel {
    /// Least stable tier admitted by this channel.
    pub fn min_tier(self) -> Tier {
        match self {
            Channel::Alpha => Tier::Alpha,
            Channel::Beta => Tier::Beta,
            Channel::ReleaseCandidate => Tier::ReleaseCandidate,
        }
    }
}

impl FromStr for Channel {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match canonical_label(&s.trim().to_ascii_lowercase()) {
            Some("a") => Ok(Channel::Alpha),
            Some("b") => Ok(Channel::Beta),
            Some("rc") => Ok(Channel::ReleaseCandidate),
            _ => Err(VersionError(format!("unknown pre-release channel {s:?}"))),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Alpha => "a",
            Channel::Beta => "b",
            Channel::ReleaseCandidate => "rc",
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version: {0}")]
pub struct VersionError(String);

/// A totally ordered application version. Build metadata is kept for display
/// but ignored by comparisons, so `1.1.0+r2` is the same release as `1.1.0`.
#[derive(Debug, Clone)]
pub struct ReleaseVersion(Version);

impl ReleaseVersion {
    fn precedence(&self) -> (u64, u64, u64, &Prerelease) {
        (self.0.major, self.0.minor, self.0.patch, &self.0.pre)
    }

    pub fn semver(&self) -> &Version {
        &self.0
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// The maturity tier, or `None` when the pre-release label is not one of
    /// the recognised tiers.
    pub fn tier(&self) -> Option<Tier> {
        if self.0.pre.is_empty() {
            return Some(Tier::Stable);
        }
        let label = self.0.pre.as_str().split('.').next().unwrap_or_default();
        Tier::from_label(label)
    }
}

impl PartialEq for ReleaseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.precedence() == other.precedence()
    }
}

impl Eq for ReleaseVersion {}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence().cmp(&other.precedence())
    }
}

impl Hash for ReleaseVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.precedence().hash(state);
    }
}

impl From<Version> for ReleaseVersion {
    fn from(version: Version) -> Self {
        ReleaseVersion(version)
    }
}

impl FromStr for ReleaseVersion {
    type Err = VersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse_version(input).map(ReleaseVersion)
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn canonical_label(label: &str) -> Option<&'static str> {
    match label {
        "a" | "alpha" => Some("a"),
        "b" | "beta" => Some("b"),
        "rc" | "c" | "pre" | "preview" => Some("rc"),
        _ => None,
    }
}

fn parse_version(input: &str) -> Result<Version, VersionError> {
    let raw = input.trim();
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    let (raw, build) = match raw.split_once('+') {
        Some((head, build)) => (head, Some(build)),
        None => (raw, None),
    };

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (release, suffix) = raw.split_at(split);
    let release = release.trim_end_matches('.');

    let numbers = release
        .split('.')
        .map(|part| part.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| VersionError(input.to_string()))?;
    if numbers.is_empty() || numbers.len() > 3 {
        return Err(VersionError(input.to_string()));
    }

    let mut version = Version::new(
        numbers[0],
        numbers.get(1).copied().unwrap_or(0),
        numbers.get(2).copied().unwrap_or(0),
    );

    let suffix = suffix.strip_prefix(['-', '.', '_']).unwrap_or(suffix);
    if !suffix.is_empty() {
        version.pre = normalize_prerelease(suffix).ok_or_else(|| VersionError(input.to_string()))?;
    }
    if let Some(build) = build {
        version.build = BuildMetadata::new(build).map_err(|_| VersionError(input.to_string()))?;
    }
    Ok(version)
}

/// Turns `a1`, `alpha.1`, `rc-2` or `beta` into `a.1`, `a.1`, `rc.2`, `b.0`.
/// Unrecognised labels are kept verbatim so they parse but never match a tier.
fn normalize_prerelease(suffix: &str) -> Option<Prerelease> {
    let lowered = suffix.to_ascii_lowercase();
    let mut identifiers = lowered.split(['.', '-', '_']).filter(|part| !part.is_empty());
    let head = identifiers.next()?;

    let label_end = head
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(head.len());
    let (label, inline_number) = head.split_at(label_end);

    let Some(canonical) = canonical_label(label) else {
        return Prerelease::new(&lowered).ok();
    };

    let mut parts = vec![canonical.to_string()];
    if !inline_number.is_empty() {
        parts.push(inline_number.to_string());
    }
    parts.extend(identifiers.map(str::to_string));
    if parts.len() == 1 {
        parts.push("0".to_string());
    }

    // semver forbids leading zeros in numeric identifiers
    let parts: Vec<String> = parts
        .into_iter()
        .map(|part| {
            if part.bytes().all(|b| b.is_ascii_digit()) {
                let trimmed = part.trim_start_matches('0');
                if trimmed.is_empty() { "0".to_string() } else { trimmed.to_string() }
            } else {
                part
            }
        })
        .collect();

    Prerelease::new(&parts.join(".")).ok()
}
