//! Recording fakes and workspace fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use devloop::adapters::{
    tagger_for, BuildRequest, BuiltImage, Builder, Deployer, GlobResolver, ImageVerifier,
    InfrastructureError, LogTailer, StatusChecker, Syncer, TagPolicy, TestFailure, Tester,
};
use devloop::core::{
    ArtifactGraph, Backends, BuildCache, CachePolicy, CancelHandle, RunContext, RunOptions, Runner,
};
use devloop::domain::{Artifact, BuildResult};

/// Builder that records every request and fails on demand
#[derive(Default)]
pub struct RecordingBuilder {
    pub calls: Mutex<Vec<String>>,
    pub failing: Mutex<BTreeSet<String>>,
    pub unreachable: AtomicBool,
    pub pruned: Mutex<Vec<String>>,

    /// `(source, new tag)` per retag
    pub tagged: Mutex<Vec<(String, String)>>,

    /// Report built images without a digest
    pub no_digest: AtomicBool,

    /// Time each build takes, in milliseconds
    pub delay_ms: AtomicU64,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,

    /// Cancel the run as soon as the named artifact starts building
    pub cancel_on: Mutex<Option<(String, Arc<CancelHandle>)>>,
}

impl RecordingBuilder {
    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn recover(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| *c == name).count()
    }

    pub fn tagged(&self) -> Vec<(String, String)> {
        self.tagged.lock().unwrap().clone()
    }

    /// Highest number of builds observed running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Builder for RecordingBuilder {
    fn name(&self) -> &str {
        "recording"
    }

    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage> {
        let name = request.artifact.name.clone();
        self.calls.lock().unwrap().push(name.clone());

        if let Some((target, handle)) = self.cancel_on.lock().unwrap().as_ref() {
            if *target == name {
                handle.cancel();
            }
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(InfrastructureError("daemon unreachable".to_string()).into());
        }
        if self.failing.lock().unwrap().contains(&name) {
            anyhow::bail!("compile error in {}", name);
        }
        let digest = if self.no_digest.load(Ordering::SeqCst) {
            None
        } else {
            Some(format!("sha256:{}", request.input_hash.0))
        };
        Ok(BuiltImage {
            tag: request.tag.clone(),
            digest,
            pushed: false,
        })
    }

    async fn tag(&self, existing: &BuildResult, tag: &str) -> Result<()> {
        self.tagged
            .lock()
            .unwrap()
            .push((existing.tag.clone(), tag.to_string()));
        Ok(())
    }

    async fn prune(&self, tags: &[String]) -> Result<()> {
        self.pruned.lock().unwrap().extend(tags.iter().cloned());
        Ok(())
    }
}

/// Tester that records the artifacts it was handed
#[derive(Default)]
pub struct RecordingTester {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub failing: Mutex<Vec<String>>,
}

impl RecordingTester {
    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().push(name.to_string());
    }

    pub fn recover(&self, name: &str) {
        self.failing.lock().unwrap().retain(|f| f != name);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tester for RecordingTester {
    async fn test(&self, built: &[BuildResult]) -> std::result::Result<(), TestFailure> {
        let names: Vec<String> = built.iter().map(|r| r.image.clone()).collect();
        self.calls.lock().unwrap().push(names.clone());

        let failed: Vec<String> = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .filter(|f| names.contains(*f))
            .cloned()
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(TestFailure {
                message: format!("{} test(s) failed", failed.len()),
                failed,
            })
        }
    }
}

/// Deployer that records every deployed artifact set
#[derive(Default)]
pub struct RecordingDeployer {
    pub deploys: Mutex<Vec<Vec<BuildResult>>>,
    pub labels: Mutex<Vec<BTreeMap<String, String>>>,
    pub cleanups: AtomicUsize,
    pub failing: AtomicBool,
    pub unreachable: AtomicBool,
}

impl RecordingDeployer {
    pub fn deploys(&self) -> Vec<Vec<BuildResult>> {
        self.deploys.lock().unwrap().clone()
    }

    /// Image names of the n-th deploy
    pub fn deployed_names(&self, n: usize) -> Vec<String> {
        self.deploys()[n].iter().map(|r| r.image.clone()).collect()
    }
}

#[async_trait]
impl Deployer for RecordingDeployer {
    async fn deploy(&self, artifacts: &[BuildResult], labels: &BTreeMap<String, String>) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(InfrastructureError("Unable to connect to the server".to_string()).into());
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("manifest rejected");
        }
        self.deploys.lock().unwrap().push(artifacts.to_vec());
        self.labels.lock().unwrap().push(labels.clone());
        Ok(())
    }

    async fn render(&self, artifacts: &[BuildResult], _labels: &BTreeMap<String, String>) -> Result<String> {
        Ok(artifacts
            .iter()
            .map(|r| format!("image: {}", r.tag))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Syncer that records synced files
#[derive(Default)]
pub struct RecordingSyncer {
    pub calls: Mutex<Vec<(String, Vec<PathBuf>, Vec<PathBuf>)>>,
    pub failing: AtomicBool,
}

impl RecordingSyncer {
    pub fn calls(&self) -> Vec<(String, Vec<PathBuf>, Vec<PathBuf>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Syncer for RecordingSyncer {
    async fn sync(&self, artifact: &BuildResult, changed: &[PathBuf], deleted: &[PathBuf]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("container not running");
        }
        self.calls
            .lock()
            .unwrap()
            .push((artifact.image.clone(), changed.to_vec(), deleted.to_vec()));
        Ok(())
    }
}

/// Status checker counting its calls
#[derive(Default)]
pub struct CountingStatus {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
}

#[async_trait]
impl StatusChecker for CountingStatus {
    async fn check(&self, _deployed: &[BuildResult]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("deployment/app not ready");
        }
        Ok(())
    }
}

/// Tailer recording the images it was asked to follow
#[derive(Default)]
pub struct RecordingTailer {
    pub followed: Mutex<Vec<Vec<String>>>,
    pub stopped: AtomicBool,
}

#[async_trait]
impl LogTailer for RecordingTailer {
    async fn follow(&self, images: &[String]) -> Result<()> {
        self.followed.lock().unwrap().push(images.to_vec());
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Registry stand-in answering every verification the same way
pub struct StaticVerifier {
    pub present: AtomicBool,
    pub calls: AtomicUsize,
}

impl StaticVerifier {
    pub fn new(present: bool) -> Self {
        Self {
            present: AtomicBool::new(present),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageVerifier for StaticVerifier {
    async fn exists(&self, _tag: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.present.load(Ordering::SeqCst))
    }
}

/// All fakes wired into a runner
#[derive(Default, Clone)]
pub struct Fakes {
    pub builder: Arc<RecordingBuilder>,
    pub tester: Arc<RecordingTester>,
    pub deployer: Arc<RecordingDeployer>,
    pub syncer: Arc<RecordingSyncer>,
    pub status: Arc<CountingStatus>,
    pub tailer: Arc<RecordingTailer>,
}

impl Fakes {
    pub fn backends(&self) -> Backends {
        Backends {
            builder: self.builder.clone(),
            tester: self.tester.clone(),
            deployer: self.deployer.clone(),
            syncer: self.syncer.clone(),
            tagger: tagger_for(&TagPolicy::InputDigest),
            status: self.status.clone(),
            tailer: self.tailer.clone(),
        }
    }
}

/// Temporary workspace with one directory per artifact
pub struct Workspace {
    _temp: TempDir,
    pub root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        Self { _temp: temp, root }
    }

    /// Write a file relative to the workspace root, returning its path
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn dir(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

/// `base` <- `app`, plus an independent `other`
pub fn three_artifacts(ws: &Workspace) -> Vec<Artifact> {
    ws.write("base/Dockerfile", "FROM scratch");
    ws.write("base/lib.c", "int base;");
    ws.write("app/Dockerfile", "FROM base");
    ws.write("app/main.c", "int main;");
    ws.write("app/static/index.html", "<html/>");
    ws.write("other/Dockerfile", "FROM scratch");
    ws.write("other/run.sh", "echo other");

    vec![
        Artifact::new("base", ws.dir("base")).with_build_file("Dockerfile"),
        Artifact::new("app", ws.dir("app"))
            .with_requires(["base"])
            .with_sync(["static/**/*"])
            .with_build_file("Dockerfile"),
        Artifact::new("other", ws.dir("other")).with_build_file("Dockerfile"),
    ]
}

pub fn graph(artifacts: Vec<Artifact>) -> ArtifactGraph {
    ArtifactGraph::new(artifacts, Arc::new(GlobResolver)).unwrap()
}

/// Runner over in-memory cache with default options
pub fn runner(artifacts: Vec<Artifact>) -> (Runner, Fakes) {
    runner_with(artifacts, RunOptions::default(), None)
}

pub fn runner_with(
    artifacts: Vec<Artifact>,
    options: RunOptions,
    verifier: Option<Arc<dyn ImageVerifier>>,
) -> (Runner, Fakes) {
    let mut cache = BuildCache::in_memory(options.cache.clone());
    if let Some(verifier) = verifier {
        cache = cache.with_verifier(verifier);
    }
    runner_over(artifacts, options, cache)
}

/// Runner over a given cache, tagging with the options' tag policy
pub fn runner_over(artifacts: Vec<Artifact>, options: RunOptions, cache: BuildCache) -> (Runner, Fakes) {
    let fakes = Fakes::default();
    let mut backends = fakes.backends();
    backends.tagger = tagger_for(&options.tag_policy);
    let runner = Runner::new(RunContext::new(options), graph(artifacts), cache, backends);
    (runner, fakes)
}

pub fn verifying_policy() -> CachePolicy {
    CachePolicy {
        verify_remote: true,
        ..CachePolicy::default()
    }
}

pub fn names(results: &[BuildResult]) -> Vec<String> {
    results.iter().map(|r| r.image.clone()).collect()
}

pub fn path_set<P: AsRef<Path>>(paths: &[P]) -> BTreeSet<PathBuf> {
    paths.iter().map(|p| p.as_ref().to_path_buf()).collect()
}
