//! Process-lifetime registry of the latest build result per artifact.
//!
//! Each artifact has its own slot lock, so concurrent builds in one wave
//! never contend on each other's writes. A reader of an artifact observes
//! either the value before or after a concurrent write, never a mix.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::domain::{BuildResult, InputHash};

#[derive(Debug, Default)]
struct Slot {
    /// Latest build result
    result: Option<BuildResult>,

    /// Input hash the running container reflects after a live sync
    synced: Option<InputHash>,
}

/// Latest build results, partitioned by artifact
#[derive(Default)]
pub struct ArtifactStore {
    slots: RwLock<HashMap<String, Arc<RwLock<Slot>>>>,
    produced: Mutex<BTreeSet<String>>,
}

impl ArtifactStore {
    /// Create a store with slots preallocated for the given artifacts
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = names
            .into_iter()
            .map(|name| (name.into(), Arc::new(RwLock::new(Slot::default()))))
            .collect();
        Self {
            slots: RwLock::new(slots),
            produced: Mutex::new(BTreeSet::new()),
        }
    }

    fn slot(&self, name: &str) -> Arc<RwLock<Slot>> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, name: &str) -> Option<Arc<RwLock<Slot>>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Record a new build result, superseding the previous one
    pub fn record(&self, result: BuildResult) {
        debug!(artifact = %result.image, tag = %result.tag, "Recording build result");
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(result.tag.clone());

        let slot = self.slot(&result.image);
        let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.result = Some(result);
        slot.synced = None;
    }

    /// Record a result built elsewhere (e.g. read from a build output
    /// file); it is not counted as produced by this process
    pub fn adopt(&self, result: BuildResult) {
        let slot = self.slot(&result.image);
        let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.result = Some(result);
        slot.synced = None;
    }

    /// Record that the running container now reflects `hash` via live sync
    pub fn record_sync(&self, name: &str, hash: InputHash) {
        let slot = self.slot(name);
        slot.write().unwrap_or_else(PoisonError::into_inner).synced = Some(hash);
    }

    /// Latest build result of an artifact
    pub fn get(&self, name: &str) -> Option<BuildResult> {
        let slot = self.existing_slot(name)?;
        let slot = slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.result.clone()
    }

    /// Input hash of the latest build result
    pub fn input_hash(&self, name: &str) -> Option<InputHash> {
        self.get(name).map(|result| result.input_hash)
    }

    /// Input hash the running container reflects: the synced hash if a
    /// sync happened after the last build, otherwise the built hash
    pub fn effective_hash(&self, name: &str) -> Option<InputHash> {
        let slot = self.existing_slot(name)?;
        let slot = slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.synced
            .clone()
            .or_else(|| slot.result.as_ref().map(|r| r.input_hash.clone()))
    }

    /// Whether any result is recorded for an artifact
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Every image reference recorded during this process
    pub fn produced_tags(&self) -> Vec<String> {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of artifacts with a recorded result
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<RwLock<Slot>>> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|slot| {
                slot.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .result
                    .is_some()
            })
            .count()
    }

    /// Whether no results are recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, tag: &str, hash: &str) -> BuildResult {
        BuildResult::new(name, tag, None, InputHash(hash.to_string()))
    }

    #[test]
    fn test_record_supersedes() {
        let store = ArtifactStore::new(["app"]);
        assert!(store.is_empty());

        store.record(result("app", "app:1", "h1"));
        store.record(result("app", "app:2", "h2"));

        assert_eq!(store.get("app").unwrap().tag, "app:2");
        assert_eq!(store.input_hash("app"), Some(InputHash("h2".to_string())));
        assert_eq!(store.len(), 1);
        assert_eq!(store.produced_tags(), vec!["app:1".to_string(), "app:2".to_string()]);
    }

    #[test]
    fn test_effective_hash_tracks_sync_until_rebuild() {
        let store = ArtifactStore::new(["web"]);
        store.record(result("web", "web:1", "built"));
        assert_eq!(store.effective_hash("web"), Some(InputHash("built".to_string())));

        store.record_sync("web", InputHash("synced".to_string()));
        assert_eq!(store.effective_hash("web"), Some(InputHash("synced".to_string())));
        assert_eq!(store.input_hash("web"), Some(InputHash("built".to_string())));

        store.record(result("web", "web:2", "rebuilt"));
        assert_eq!(store.effective_hash("web"), Some(InputHash("rebuilt".to_string())));
    }

    #[test]
    fn test_unknown_artifacts_get_slots_on_write() {
        let store = ArtifactStore::default();
        assert!(store.get("late").is_none());

        store.record(result("late", "late:1", "h"));
        assert!(store.contains("late"));
    }

    #[test]
    fn test_adopted_results_are_not_produced() {
        let store = ArtifactStore::new(["app"]);
        store.adopt(result("app", "registry/app:prebuilt", "h"));

        assert_eq!(store.get("app").unwrap().tag, "registry/app:prebuilt");
        assert!(store.produced_tags().is_empty());
    }

    #[test]
    fn test_concurrent_writes_to_different_artifacts() {
        let store = Arc::new(ArtifactStore::new(["a", "b"]));
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.record(result(name, &format!("{}:{}", name, i), "h"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("a").unwrap().tag, "a:99");
        assert_eq!(store.get("b").unwrap().tag, "b:99");
    }
}
