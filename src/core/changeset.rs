//! Change-set reconciliation.
//!
//! Turns a debounced batch of raw file events into the minimal plan for a
//! cycle: which artifacts to rebuild, which to resync, and which deleted
//! paths to forward to the syncer. The result depends only on the events,
//! the graph and the artifact store, so replaying a batch against the same
//! store yields the same change set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::domain::{ChangeSet, FileEvent, FileEventKind};

use super::cache::CachePolicy;
use super::graph::ArtifactGraph;
use super::hash::InputHasher;
use super::store::ArtifactStore;

#[derive(Debug, Default)]
struct Touched {
    changed: BTreeSet<PathBuf>,
    deleted: BTreeSet<PathBuf>,
    build_file: bool,

    /// Ownership could not be determined; rebuild to be safe
    unresolved: bool,
}

/// Maps file events through the artifact graph to a change set
pub struct Reconciler {
    graph: Arc<ArtifactGraph>,
    store: Arc<ArtifactStore>,
    policy: CachePolicy,
}

impl Reconciler {
    pub fn new(graph: Arc<ArtifactGraph>, store: Arc<ArtifactStore>, policy: CachePolicy) -> Self {
        Self {
            graph,
            store,
            policy,
        }
    }

    /// Compute the change set for a batch of events
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn reconcile(&self, events: &[FileEvent]) -> ChangeSet {
        let mut changes = ChangeSet::default();
        if events.is_empty() {
            return changes;
        }

        let by_owner = self.group_by_owner(events);
        if by_owner.is_empty() {
            debug!("No tracked files changed");
            return changes;
        }

        let mut hasher = InputHasher::new(&self.graph);

        for name in self.graph.build_order() {
            let Some(touched) = by_owner.get(name) else {
                continue;
            };
            for path in &touched.deleted {
                changes.add_deleted(name, path.clone());
            }

            if self.policy.is_no_rebuild(name) && self.store.contains(name) {
                debug!(artifact = %name, "Inputs changed but artifact is pinned, reusing result");
                continue;
            }

            if touched.unresolved {
                changes.add_rebuild(name.clone());
                continue;
            }

            let current = match hasher.hash(name).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(artifact = %name, error = %e, "Failed to hash inputs, forcing rebuild");
                    changes.add_rebuild(name.clone());
                    continue;
                }
            };

            let Some(recorded) = self.store.effective_hash(name) else {
                debug!(artifact = %name, "No previous build, marking for rebuild");
                changes.add_rebuild(name.clone());
                continue;
            };
            if recorded == current {
                debug!(artifact = %name, hash = %current.short(), "Input hash unchanged");
                continue;
            }

            if self.can_sync(name, touched) {
                debug!(artifact = %name, files = touched.changed.len(), "Marking for resync");
                changes.add_resync(name, touched.changed.iter().cloned());
            } else {
                debug!(artifact = %name, hash = %current.short(), "Marking for rebuild");
                changes.add_rebuild(name.clone());
            }
        }

        let closed = self.graph.with_dependents(&changes.rebuild);
        for name in closed {
            changes.add_rebuild(name);
        }

        debug!(
            rebuild = ?changes.rebuild,
            resync = ?changes.resync.keys().collect::<Vec<_>>(),
            "Reconciled change set"
        );
        changes
    }

    /// Owning artifacts per event, refreshing source sets when the file
    /// set itself may have changed
    fn group_by_owner(&self, events: &[FileEvent]) -> BTreeMap<String, Touched> {
        let mut touched: BTreeMap<String, Touched> = BTreeMap::new();

        for event in events {
            for artifact in self.graph.artifacts() {
                let owned = match self.graph.sources().owns(artifact, &event.path) {
                    Ok(owned) => owned,
                    Err(e) => {
                        warn!(artifact = %artifact.name, error = %e, "Failed to resolve sources");
                        touched.entry(artifact.name.clone()).or_default().unresolved = true;
                        continue;
                    }
                };
                if !owned {
                    continue;
                }

                let is_build_file = artifact.is_build_file(&event.path);
                if is_build_file || event.kind != FileEventKind::Modified {
                    self.graph.sources().refresh(&artifact.name);
                }

                let entry = touched.entry(artifact.name.clone()).or_default();
                entry.build_file |= is_build_file;
                if event.is_deletion() {
                    entry.deleted.insert(event.path.clone());
                    entry.changed.remove(&event.path);
                } else {
                    entry.deleted.remove(&event.path);
                    entry.changed.insert(event.path.clone());
                }
            }
        }
        touched
    }

    /// Every touched file is whitelisted for sync and a result exists to
    /// sync into
    fn can_sync(&self, name: &str, touched: &Touched) -> bool {
        let Some(artifact) = self.graph.artifact(name) else {
            return false;
        };
        artifact.supports_sync()
            && !touched.build_file
            && self.store.contains(name)
            && touched
                .changed
                .iter()
                .chain(touched.deleted.iter())
                .all(|path| artifact.is_sync_eligible(path))
    }
}
