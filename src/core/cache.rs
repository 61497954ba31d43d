//! Content-addressable build cache.
//!
//! Maps an artifact's input hash to a previously produced build result.
//! Lookups fail open: a backend or verification error degrades to a miss
//! (forcing a rebuild) and is logged, never propagated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::adapters::ImageVerifier;
use crate::domain::{BuildResult, DigestSource, InputHash};

use super::error::CacheError;

/// Cache behavior for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Use the cache at all (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Confirm cached images still exist in the registry before serving
    /// them (default: false)
    #[serde(default)]
    pub verify_remote: bool,

    /// Artifacts whose existing result is reused even when inputs changed
    #[serde(default)]
    pub no_rebuild: BTreeSet<String>,

    /// Timeout for a single registry verification (default: 10s)
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_seconds: u64,

    /// Persist the cache to this file (relative to the devloop home)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}
fn default_verify_timeout() -> u64 {
    10
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            verify_remote: false,
            no_rebuild: BTreeSet::new(),
            verify_timeout_seconds: default_verify_timeout(),
            file: None,
        }
    }
}

impl CachePolicy {
    /// Whether the policy pins this artifact to its existing result
    pub fn is_no_rebuild(&self, name: &str) -> bool {
        self.no_rebuild.contains(name)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_seconds)
    }
}

/// A cached build result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: BuildResult,
    pub digest_source: DigestSource,
}

/// Storage behind the build cache
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, artifact: &str, hash: &InputHash) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or overwrite (last write wins)
    async fn put(&self, artifact: &str, hash: &InputHash, entry: CacheEntry) -> Result<(), CacheError>;
}

type Shard = Arc<Mutex<HashMap<InputHash, CacheEntry>>>;

/// In-memory backend, partitioned by artifact
#[derive(Default)]
pub struct MemoryBackend {
    shards: RwLock<HashMap<String, Shard>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, artifact: &str) -> Shard {
        if let Some(shard) = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(artifact)
        {
            return shard.clone();
        }
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(artifact.to_string())
            .or_default()
            .clone()
    }

    /// Copy of every entry, ordered for stable serialization
    async fn snapshot(&self) -> BTreeMap<String, BTreeMap<InputHash, CacheEntry>> {
        let shards: Vec<(String, Shard)> = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, shard)| (name.clone(), shard.clone()))
            .collect();

        let mut snapshot = BTreeMap::new();
        for (name, shard) in shards {
            let entries = shard.lock().await;
            snapshot.insert(
                name,
                entries.iter().map(|(h, e)| (h.clone(), e.clone())).collect(),
            );
        }
        snapshot
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, artifact: &str, hash: &InputHash) -> Result<Option<CacheEntry>, CacheError> {
        let shard = self.shard(artifact);
        let entries = shard.lock().await;
        Ok(entries.get(hash).cloned())
    }

    async fn put(&self, artifact: &str, hash: &InputHash, entry: CacheEntry) -> Result<(), CacheError> {
        let shard = self.shard(artifact);
        shard.lock().await.insert(hash.clone(), entry);
        Ok(())
    }
}

/// Backend persisted as JSON, shared between processes via a file lock
pub struct FileBackend {
    path: PathBuf,
    memory: MemoryBackend,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Open (or create) a cache file
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let memory = MemoryBackend::new();

        let existing = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || read_locked(&path))
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))??
        };

        for (artifact, entries) in existing {
            for (hash, entry) in entries {
                memory.put(&artifact, &hash, entry).await?;
            }
        }

        debug!(path = %path.display(), "Opened build cache file");
        Ok(Self {
            path,
            memory,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

type Persisted = BTreeMap<String, BTreeMap<InputHash, CacheEntry>>;

fn read_locked(path: &Path) -> Result<Persisted, CacheError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let mut file = OpenOptions::new().read(true).open(path)?;
    file.lock_shared()?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    file.unlock()?;

    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(&content)?)
}

fn write_locked(path: &Path, snapshot: &Persisted) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    file.lock_exclusive()?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(json.as_bytes())?;
    file.flush()?;
    file.unlock()?;
    Ok(())
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn get(&self, artifact: &str, hash: &InputHash) -> Result<Option<CacheEntry>, CacheError> {
        self.memory.get(artifact, hash).await
    }

    async fn put(&self, artifact: &str, hash: &InputHash, entry: CacheEntry) -> Result<(), CacheError> {
        self.memory.put(artifact, hash, entry).await?;

        let _guard = self.write_lock.lock().await;
        let snapshot = self.memory.snapshot().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_locked(&path, &snapshot))
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?
    }
}

/// Why a lookup missed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// Caching disabled by policy
    Disabled,

    /// No entry for this input hash
    NotFound,

    /// The registry no longer has the image
    RemoteMissing,

    /// Verification errored or timed out
    VerificationFailed(String),

    /// The backend errored
    Unavailable(String),
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// The build cache
pub struct BuildCache {
    backend: Arc<dyn CacheBackend>,
    verifier: Option<Arc<dyn ImageVerifier>>,
    policy: CachePolicy,
}

impl BuildCache {
    pub fn new(backend: Arc<dyn CacheBackend>, policy: CachePolicy) -> Self {
        Self {
            backend,
            verifier: None,
            policy,
        }
    }

    /// In-memory cache with the given policy
    pub fn in_memory(policy: CachePolicy) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), policy)
    }

    /// Attach a registry verifier
    pub fn with_verifier(mut self, verifier: Arc<dyn ImageVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Look up a previous result for `hash`
    pub async fn lookup(&self, artifact: &str, hash: &InputHash) -> CacheLookup {
        if !self.policy.enabled {
            return CacheLookup::Miss(MissReason::Disabled);
        }

        let entry = match self.backend.get(artifact, hash).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return CacheLookup::Miss(MissReason::NotFound),
            Err(e) => {
                warn!(artifact, error = %e, "Build cache unavailable, forcing rebuild");
                return CacheLookup::Miss(MissReason::Unavailable(e.to_string()));
            }
        };

        if self.policy.verify_remote {
            if let Some(miss) = self.verify(artifact, &entry).await {
                return CacheLookup::Miss(miss);
            }
        }

        debug!(artifact, hash = %hash.short(), tag = %entry.result.tag, "Build cache hit");
        CacheLookup::Hit(entry)
    }

    async fn verify(&self, artifact: &str, entry: &CacheEntry) -> Option<MissReason> {
        let Some(verifier) = &self.verifier else {
            warn!(artifact, "Remote verification required but no verifier configured");
            return Some(MissReason::VerificationFailed("no verifier configured".to_string()));
        };

        let tag = entry.result.tag.as_str();
        match tokio::time::timeout(self.policy.verify_timeout(), verifier.exists(tag)).await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => {
                warn!(artifact, tag, "Cached image missing from registry, forcing rebuild");
                Some(MissReason::RemoteMissing)
            }
            Ok(Err(e)) => {
                warn!(artifact, tag, error = %e, "Failed to verify cached image, forcing rebuild");
                Some(MissReason::VerificationFailed(e.to_string()))
            }
            Err(_) => {
                warn!(artifact, tag, "Timed out verifying cached image, forcing rebuild");
                Some(MissReason::VerificationFailed("timed out".to_string()))
            }
        }
    }

    /// New result sharing the cached image's digest under a fresh tag
    pub fn retag(&self, existing: &BuildResult, tag: &str) -> BuildResult {
        BuildResult::new(
            existing.image.clone(),
            tag,
            existing.digest.clone(),
            existing.input_hash.clone(),
        )
    }

    /// Insert or overwrite the entry for `hash`. Failures are logged only.
    pub async fn store(&self, artifact: &str, hash: &InputHash, result: BuildResult, source: DigestSource) {
        if !self.policy.enabled {
            return;
        }
        let entry = CacheEntry {
            result,
            digest_source: source,
        };
        if let Err(e) = self.backend.put(artifact, hash, entry).await {
            warn!(artifact, error = %e, "Failed to write build cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(s: &str) -> InputHash {
        InputHash(s.to_string())
    }

    fn result(tag: &str, h: &str) -> BuildResult {
        BuildResult::new("app", tag, Some("sha256:abc".to_string()), hash(h))
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let cache = BuildCache::in_memory(CachePolicy::default());
        assert_eq!(cache.lookup("app", &hash("h1")).await, CacheLookup::Miss(MissReason::NotFound));

        cache.store("app", &hash("h1"), result("app:1", "h1"), DigestSource::Local).await;
        match cache.lookup("app", &hash("h1")).await {
            CacheLookup::Hit(entry) => {
                assert_eq!(entry.result.tag, "app:1");
                assert_eq!(entry.digest_source, DigestSource::Local);
            }
            other => panic!("Expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = BuildCache::in_memory(CachePolicy::default());
        cache.store("app", &hash("h1"), result("app:1", "h1"), DigestSource::Local).await;
        cache.store("app", &hash("h1"), result("app:2", "h1"), DigestSource::Remote).await;

        match cache.lookup("app", &hash("h1")).await {
            CacheLookup::Hit(entry) => assert_eq!(entry.result.tag, "app:2"),
            other => panic!("Expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_policy_always_misses() {
        let policy = CachePolicy {
            enabled: false,
            ..Default::default()
        };
        let cache = BuildCache::in_memory(policy);
        cache.store("app", &hash("h1"), result("app:1", "h1"), DigestSource::Local).await;

        assert_eq!(cache.lookup("app", &hash("h1")).await, CacheLookup::Miss(MissReason::Disabled));
    }

    #[test]
    fn test_retag_keeps_digest() {
        let cache = BuildCache::in_memory(CachePolicy::default());
        let original = result("app:1", "h1");
        let retagged = cache.retag(&original, "app:2");

        assert_eq!(retagged.tag, "app:2");
        assert_eq!(retagged.digest, original.digest);
        assert_eq!(retagged.input_hash, original.input_hash);
    }

    #[tokio::test]
    async fn test_file_backend_persists_across_opens() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache").join("cache.json");

        let backend = FileBackend::open(&path).await.unwrap();
        let entry = CacheEntry {
            result: result("app:1", "h1"),
            digest_source: DigestSource::Remote,
        };
        backend.put("app", &hash("h1"), entry.clone()).await.unwrap();

        let reopened = FileBackend::open(&path).await.unwrap();
        assert_eq!(reopened.get("app", &hash("h1")).await.unwrap(), Some(entry));
        assert_eq!(reopened.get("app", &hash("h2")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_backend_rejects_corrupt_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(FileBackend::open(&path).await.is_err());
    }
}
