//! File events and the per-cycle change set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of a raw filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// A raw filesystem change reported by the file monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileEventKind::Created)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileEventKind::Modified)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileEventKind::Deleted)
    }

    pub fn is_deletion(&self) -> bool {
        self.kind == FileEventKind::Deleted
    }
}

/// Plan for one reconciliation cycle.
///
/// Ordered collections keep the set a deterministic function of its inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Artifacts that must be rebuilt (closed over dependents)
    pub rebuild: BTreeSet<String>,

    /// Artifacts whose changed files can be synced, with those files
    pub resync: BTreeMap<String, BTreeSet<PathBuf>>,

    /// Deleted paths per owning artifact
    pub deleted: BTreeMap<String, BTreeSet<PathBuf>>,
}

impl ChangeSet {
    /// Nothing to rebuild or resync
    pub fn is_empty(&self) -> bool {
        self.rebuild.is_empty() && self.resync.is_empty()
    }

    /// Derived flag: a redeploy follows any rebuild or resync
    pub fn needs_redeploy(&self) -> bool {
        !self.is_empty()
    }

    /// Mark an artifact for rebuild; a rebuild supersedes any pending resync
    pub fn add_rebuild(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.resync.remove(&name);
        self.rebuild.insert(name);
    }

    /// Record files to sync for an artifact not already being rebuilt
    pub fn add_resync<I>(&mut self, name: &str, files: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        if self.rebuild.contains(name) {
            return;
        }
        self.resync.entry(name.to_string()).or_default().extend(files);
    }

    /// Record a deleted path for an artifact
    pub fn add_deleted(&mut self, name: &str, path: PathBuf) {
        self.deleted.entry(name.to_string()).or_default().insert(path);
    }

    /// Deleted paths recorded for an artifact
    pub fn deleted_for(&self, name: &str) -> Vec<PathBuf> {
        self.deleted
            .get(name)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fold another change set into this one
    pub fn merge(&mut self, other: ChangeSet) {
        for name in other.rebuild {
            self.add_rebuild(name);
        }
        for (name, files) in other.resync {
            self.add_resync(&name, files);
        }
        for (name, paths) in other.deleted {
            self.deleted.entry(name).or_default().extend(paths);
        }
    }
}
