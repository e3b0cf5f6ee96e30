//! Purge planning for the install directory.
//!
//! Planning is a pure function of a directory snapshot and the exclusion
//! set, so it can be tested without touching the filesystem and shown to the
//! host as a dry run before anything is deleted.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::ApplyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Every entry below a directory, keyed by path relative to that directory.
/// Symlinks are recorded but never followed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSnapshot {
    entries: BTreeMap<PathBuf, EntryKind>,
}

impl DirSnapshot {
    /// Walk `root` recursively. A missing root yields an empty snapshot.
    pub fn capture(root: &Path) -> io::Result<Self> {
        let mut snapshot = Self::default();
        if root.exists() {
            snapshot.walk(root, Path::new(""))?;
        }
        Ok(snapshot)
    }

    pub fn from_entries<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, EntryKind)>,
        P: Into<PathBuf>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(path, kind)| (path.into(), kind))
                .collect(),
        }
    }

    /// Entries in path order; a directory always precedes its contents.
    pub fn entries(&self) -> impl Iterator<Item = (&Path, EntryKind)> {
        self.entries.iter().map(|(path, kind)| (path.as_path(), *kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn walk(&mut self, root: &Path, relative: &Path) -> io::Result<()> {
        for entry in std::fs::read_dir(root.join(relative))? {
            let entry = entry?;
            let path = relative.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                self.entries.insert(path, EntryKind::Symlink);
            } else if file_type.is_dir() {
                self.entries.insert(path.clone(), EntryKind::Dir);
                self.walk(root, &path)?;
            } else {
                self.entries.insert(path, EntryKind::File);
            }
        }
        Ok(())
    }
}

/// Paths inside the install directory that a purge must leave alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    paths: Vec<PathBuf>,
}

impl ExclusionSet {
    /// Accepts paths relative to `install_dir`, or absolute paths inside it.
    pub fn new<I, P>(install_dir: &Path, paths: I) -> Result<Self, ApplyError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut normalised = Vec::new();
        for raw in paths {
            let raw = raw.as_ref();
            let relative = if raw.is_absolute() {
                raw.strip_prefix(install_dir)
                    .map_err(|_| ApplyError::InvalidExclusion(raw.to_path_buf()))?
            } else {
                raw
            };
            let clean = clean_relative(relative)
                .ok_or_else(|| ApplyError::InvalidExclusion(raw.to_path_buf()))?;
            if !normalised.contains(&clean) {
                normalised.push(clean);
            }
        }
        Ok(Self { paths: normalised })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// `path` is an excluded path or lies below one.
    pub fn excludes(&self, path: &Path) -> bool {
        self.paths.iter().any(|excluded| path.starts_with(excluded))
    }

    /// `path` must survive a purge: it is excluded, or it contains something
    /// that is.
    pub fn protects(&self, path: &Path) -> bool {
        self.paths
            .iter()
            .any(|excluded| path.starts_with(excluded) || excluded.starts_with(path))
    }
}

/// What a purge would do to the install directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgePlan {
    /// Topmost entries to remove; their contents go with them.
    pub delete: Vec<PathBuf>,
    /// Entries that survive because of an exclusion.
    pub keep: Vec<PathBuf>,
}

impl PurgePlan {
    /// Whether `path` is removed by this plan, directly or through an ancestor.
    pub fn removes(&self, path: &Path) -> bool {
        self.delete.iter().any(|deleted| path.starts_with(deleted))
    }
}

/// Plan a purge of everything in `snapshot` except what `exclusions` protects.
pub fn plan_purge(snapshot: &DirSnapshot, exclusions: &ExclusionSet) -> PurgePlan {
    let mut plan = PurgePlan::default();
    for (path, _) in snapshot.entries() {
        if exclusions.protects(path) {
            plan.keep.push(path.to_path_buf());
            continue;
        }
        let covered = plan
            .delete
            .last()
            .map(|deleted| path.starts_with(deleted))
            .unwrap_or(false);
        if !covered {
            plan.delete.push(path.to_path_buf());
        }
    }
    plan
}

fn clean_relative(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}
