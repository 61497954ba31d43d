//! The dev loop orchestrator.
//!
//! Runs the build → test → deploy → post-deploy cycle. Each cycle starts
//! from a plan (file-driven change set, carried-over work and taken
//! intents), syncs what can be synced, builds the rest wave by wave,
//! tests the fresh results and deploys the full current artifact set.
//!
//! Only graph, configuration and infrastructure errors leave the loop;
//! everything else lands in the cycle's [`CycleReport`].

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    BuildRequest, Builder, Deployer, InfrastructureError, LogTailer, StatusChecker, Syncer,
    TagContext, Tagger, TestFailure, Tester,
};
use crate::domain::{
    Artifact, ArtifactOutcome, BuildResult, ChangeSet, CycleReport, DigestSource, FileEvent,
    InputHash, PhaseOutcome, Trigger,
};
use crate::watch::Debouncer;

use super::cache::{BuildCache, CacheLookup};
use super::changeset::Reconciler;
use super::context::{CancelToken, RunContext, TestFailurePolicy};
use super::error::DevError;
use super::graph::ArtifactGraph;
use super::hash::InputHasher;
use super::images::{apply_default_repo, ImageSelector};
use super::intents::Intents;
use super::store::ArtifactStore;

/// External collaborators used by the runner
#[derive(Clone)]
pub struct Backends {
    pub builder: Arc<dyn Builder>,
    pub tester: Arc<dyn Tester>,
    pub deployer: Arc<dyn Deployer>,
    pub syncer: Arc<dyn Syncer>,
    pub tagger: Arc<dyn Tagger>,
    pub status: Arc<dyn StatusChecker>,
    pub tailer: Arc<dyn LogTailer>,
}

/// Work accepted by an earlier cycle but not yet acted on
#[derive(Debug, Default)]
struct Pending {
    changes: ChangeSet,
    deploy: bool,

    /// Committed results the tester has not seen yet
    untested: BTreeSet<String>,
}

/// Outcome of a building phase
#[derive(Debug, Default)]
struct BuildPhase {
    /// Results produced this cycle, in build order
    built: Vec<BuildResult>,

    /// Artifacts that failed or were skipped because a dependency failed
    failed: BTreeSet<String>,
}

/// Everything a build task needs, owned
struct BuildJob {
    artifact: Artifact,
    tag: String,
    input_hash: InputHash,
    dependencies: BTreeMap<String, String>,
}

type BuildTaskResult = (String, anyhow::Result<(BuildResult, ArtifactOutcome)>);

/// Orchestrates builds, tests and deploys for one project
pub struct Runner {
    ctx: Arc<RunContext>,
    graph: Arc<ArtifactGraph>,
    cache: Arc<BuildCache>,
    store: Arc<ArtifactStore>,
    intents: Arc<Intents>,
    backends: Backends,
    selector: ImageSelector,
    reconciler: Reconciler,
    pending: Mutex<Pending>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CycleReport>>>,
}

impl Runner {
    pub fn new(ctx: RunContext, graph: ArtifactGraph, cache: BuildCache, backends: Backends) -> Self {
        let options = ctx.options();
        let intents = Intents::new(options.auto_build, options.auto_sync, options.auto_deploy);
        let graph = Arc::new(graph);
        let store = Arc::new(ArtifactStore::new(graph.names()));
        let reconciler = Reconciler::new(graph.clone(), store.clone(), cache.policy().clone());

        Self {
            ctx: Arc::new(ctx),
            graph,
            cache: Arc::new(cache),
            store,
            intents: Arc::new(intents),
            backends,
            selector: ImageSelector::new(),
            reconciler,
            pending: Mutex::new(Pending::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn graph(&self) -> &ArtifactGraph {
        &self.graph
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Shared handle for external intent triggers
    pub fn intents(&self) -> Arc<Intents> {
        self.intents.clone()
    }

    pub fn selector(&self) -> &ImageSelector {
        &self.selector
    }

    /// Receive every cycle report produced from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CycleReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn has_built(&self) -> bool {
        self.ctx.has_built()
    }

    pub fn has_deployed(&self) -> bool {
        self.ctx.has_deployed()
    }

    pub fn dev_iteration(&self) -> u64 {
        self.ctx.iteration()
    }

    /// Rewrite an image name into the configured default repo
    pub fn apply_default_repo(&self, image: &str) -> String {
        apply_default_repo(self.ctx.options().default_repo.as_deref(), image)
    }

    /// Build the named artifacts (all when empty) and their dependencies
    #[instrument(skip(self, cancel))]
    pub async fn build(&self, names: &[String], cancel: &CancelToken) -> Result<Vec<BuildResult>, DevError> {
        let mut selected = BTreeSet::new();
        if names.is_empty() {
            selected = self.graph.names();
        }
        for name in names {
            if !self.graph.contains(name) {
                return Err(DevError::Config(format!("Unknown artifact '{}'", name)));
            }
            selected.extend(self.graph.dependencies(name));
            selected.insert(name.clone());
        }

        let mut report = CycleReport::new(self.ctx.iteration(), Trigger::Intent);
        let phase = self.build_phase(&selected, self.ctx.iteration(), &mut report, cancel).await?;

        if let Some(name) = phase.failed.iter().next() {
            let message = match report.outcome(name) {
                Some(ArtifactOutcome::Failed { error }) => error.clone(),
                Some(ArtifactOutcome::Skipped { dependency }) => {
                    format!("dependency '{}' failed", dependency)
                }
                _ => "build failed".to_string(),
            };
            return Err(DevError::Build {
                artifact: name.clone(),
                message,
            });
        }
        Ok(phase.built)
    }

    /// Run tests against built artifacts. Artifacts whose tests fail are
    /// held back from later deploys until a newer result passes.
    pub async fn test(&self, built: &[BuildResult]) -> Result<(), DevError> {
        let tested: Vec<String> = built.iter().map(|r| r.image.clone()).collect();
        match self.backends.tester.test(built).await {
            Ok(()) => {
                self.ctx.record_tests(&tested, &[]);
                Ok(())
            }
            Err(failure) => {
                let (passed, failed) = split_failure(&tested, &failure);
                self.ctx.record_tests(&passed, &failed);
                Err(DevError::Test {
                    failed: failure.failed,
                    message: failure.message,
                })
            }
        }
    }

    /// Deploy `built` together with every other known result, then follow
    /// the deployed images
    pub async fn deploy_and_log(&self, built: &[BuildResult]) -> Result<(), DevError> {
        for result in built {
            self.store.adopt(result.clone());
        }
        let artifacts = self.current_artifacts();
        self.deploy(&artifacts).await?;
        self.post_deploy(&artifacts).await;
        Ok(())
    }

    /// Deploy previously built artifacts as given
    pub async fn apply(&self, built: &[BuildResult]) -> Result<(), DevError> {
        for result in built {
            self.store.adopt(result.clone());
        }
        self.deploy(built).await
    }

    /// Render manifests for `built`
    pub async fn render(&self, built: &[BuildResult]) -> Result<String, DevError> {
        self.backends
            .deployer
            .render(built, &self.ctx.labels())
            .await
            .map_err(|e| classify(e, DevError::Deploy))
    }

    /// Delete deployed resources, if anything was deployed
    pub async fn cleanup(&self) -> Result<(), DevError> {
        if !self.ctx.has_deployed() {
            debug!("Nothing deployed, skipping cleanup");
            return Ok(());
        }
        info!("Cleaning up deployed resources");
        self.backends
            .deployer
            .cleanup()
            .await
            .map_err(|e| classify(e, DevError::Deploy))
    }

    /// Remove images built by this process, if anything was built
    pub async fn prune(&self) -> Result<(), DevError> {
        if !self.ctx.has_built() {
            debug!("Nothing built, skipping prune");
            return Ok(());
        }
        let tags = self.store.produced_tags();
        info!(images = tags.len(), "Pruning built images");
        self.backends
            .builder
            .prune(&tags)
            .await
            .map_err(|e| classify(e, |message| DevError::Build {
                artifact: "*".to_string(),
                message,
            }))
    }

    /// Enter the long-lived dev loop.
    ///
    /// Returns `Ok` when cancelled and `Err` only for fatal errors.
    #[instrument(skip_all, fields(run_id = %self.ctx.run_id()))]
    pub async fn dev(&self, mut events: mpsc::Receiver<FileEvent>, cancel: CancelToken) -> Result<(), DevError> {
        info!(artifacts = self.graph.len(), "Starting dev loop");

        let result = self.dev_loop(&mut events, &cancel).await;
        self.backends.tailer.stop().await;

        match &result {
            Ok(()) => info!(iterations = self.ctx.iteration(), "Dev loop stopped"),
            Err(e) => error!(error = %e, "Dev loop terminated"),
        }
        result
    }

    async fn dev_loop(&self, events: &mut mpsc::Receiver<FileEvent>, cancel: &CancelToken) -> Result<(), DevError> {
        if !self.handle_cycle(self.run_cycle(Trigger::Startup, &[], cancel).await)? {
            return Ok(());
        }

        let options = self.ctx.options();
        let mut debouncer = Debouncer::new(options.debounce, options.max_wait);
        let mut events_open = true;

        loop {
            let (trigger, batch) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                batch = debouncer.next_batch(events), if events_open => match batch {
                    Some(batch) => (Trigger::FileChanges, batch),
                    None => {
                        warn!("File monitor closed, only intents will trigger cycles");
                        events_open = false;
                        continue;
                    }
                },
                _ = self.intents.notified() => (Trigger::Intent, Vec::new()),
            };

            if !self.handle_cycle(self.run_cycle(trigger, &batch, cancel).await)? {
                return Ok(());
            }
        }
    }

    /// Whether the loop should keep going after a cycle
    fn handle_cycle(&self, result: Result<CycleReport, DevError>) -> Result<bool, DevError> {
        match result {
            Ok(_) => Ok(true),
            Err(DevError::Cancelled) => Ok(false),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "Cycle failed");
                Ok(true)
            }
        }
    }

    /// Run one reconciliation cycle
    #[instrument(skip(self, events, cancel), fields(events = events.len()))]
    pub async fn run_cycle(
        &self,
        trigger: Trigger,
        events: &[FileEvent],
        cancel: &CancelToken,
    ) -> Result<CycleReport, DevError> {
        let started = Instant::now();

        // Planning
        let changes = self.reconciler.reconcile(events).await;
        let mut plan = self.take_pending();
        plan.changes.merge(changes);

        let taken = self.intents.take_all();
        let startup = trigger == Trigger::Startup;
        if startup || taken.build {
            for name in self.graph.build_order() {
                plan.changes.add_rebuild(name.clone());
            }
        }

        let act_build = startup || taken.build || self.intents.auto_build();
        let act_sync = startup || taken.sync || self.intents.auto_sync();
        let act_deploy = startup || taken.deploy || self.intents.auto_deploy();

        let mut deferred = Pending::default();
        if !act_build && !plan.changes.rebuild.is_empty() {
            debug!(artifacts = ?plan.changes.rebuild, "Deferring rebuild until requested");
            deferred.changes.rebuild = mem::take(&mut plan.changes.rebuild);
        }
        if !act_sync && !plan.changes.resync.is_empty() {
            debug!(artifacts = ?plan.changes.resync.keys().collect::<Vec<_>>(), "Deferring sync until requested");
            deferred.changes.resync = mem::take(&mut plan.changes.resync);
            deferred.changes.deleted = mem::take(&mut plan.changes.deleted);
        }

        let wants_deploy =
            plan.changes.needs_redeploy() || taken.deploy || (plan.deploy && act_deploy);
        if plan.changes.is_empty() && !wants_deploy && plan.untested.is_empty() {
            deferred.deploy |= plan.deploy;
            self.put_pending(deferred);
            let report = CycleReport::new(self.ctx.iteration(), trigger)
                .with_duration(started.elapsed().as_millis() as u64);
            debug!("No changes, nothing to do");
            self.publish(&report);
            return Ok(report);
        }

        let iteration = self.ctx.next_iteration();
        let mut report = CycleReport::new(iteration, trigger);
        info!(
            iteration,
            rebuild = plan.changes.rebuild.len(),
            resync = plan.changes.resync.len(),
            "Starting dev iteration"
        );

        let result = self
            .execute(plan, act_deploy, iteration, &mut report, &mut deferred, cancel)
            .await;
        self.put_pending(deferred);
        result?;

        let report = report.with_duration(started.elapsed().as_millis() as u64);
        log_report(&report);
        self.publish(&report);
        Ok(report)
    }

    /// Syncing, Building, Testing and Deploying phases of a cycle
    async fn execute(
        &self,
        mut plan: Pending,
        act_deploy: bool,
        iteration: u64,
        report: &mut CycleReport,
        deferred: &mut Pending,
        cancel: &CancelToken,
    ) -> Result<(), DevError> {
        deferred.untested.append(&mut plan.untested);

        if !plan.changes.resync.is_empty() {
            let fallback = self.sync_phase(&plan.changes, report).await;
            for name in self.graph.with_dependents(&fallback) {
                plan.changes.add_rebuild(name);
            }
        }

        if !plan.changes.rebuild.is_empty() {
            let phase = self
                .build_phase(&plan.changes.rebuild, iteration, report, cancel)
                .await?;
            deferred
                .untested
                .extend(phase.built.iter().map(|r| r.image.clone()));

            if !phase.failed.is_empty() {
                for name in &phase.failed {
                    deferred.changes.add_rebuild(name.clone());
                }
                deferred.deploy = true;
                let reason = format!(
                    "build failed for [{}]",
                    phase.failed.iter().cloned().collect::<Vec<_>>().join(", ")
                );
                report.test = PhaseOutcome::Skipped {
                    reason: reason.clone(),
                };
                report.deploy = PhaseOutcome::Skipped { reason };
                return Ok(());
            }
        }

        if cancel.is_cancelled() {
            return Err(DevError::Cancelled);
        }

        // Fresh builds plus results committed by earlier failed cycles
        let untested: Vec<BuildResult> = self
            .graph
            .build_order()
            .iter()
            .filter(|name| deferred.untested.contains(*name))
            .filter_map(|name| self.store.get(name))
            .collect();
        deferred.untested.clear();

        if !untested.is_empty() && !self.test_phase(&untested, report).await {
            report.deploy = PhaseOutcome::Skipped {
                reason: "tests failed".to_string(),
            };
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(DevError::Cancelled);
        }

        if !act_deploy {
            debug!("Deferring deploy until requested");
            deferred.deploy = true;
            report.deploy = PhaseOutcome::Skipped {
                reason: "waiting for deploy request".to_string(),
            };
            return Ok(());
        }

        let artifacts = self.current_artifacts();
        if artifacts.is_empty() {
            report.deploy = PhaseOutcome::Skipped {
                reason: "no artifacts built".to_string(),
            };
            return Ok(());
        }

        match self.deploy(&artifacts).await {
            Ok(()) => {
                report.deploy = PhaseOutcome::Succeeded;
                self.check_status(&artifacts, report).await;
                self.post_deploy(&artifacts).await;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Deploy failed, keeping previous deployment");
                report.deploy = PhaseOutcome::Failed {
                    error: e.to_string(),
                };
                report.with_error(e.to_string());
            }
        }
        Ok(())
    }

    /// Run the tester over `built`, returning whether the deploy may go
    /// ahead
    async fn test_phase(&self, built: &[BuildResult], report: &mut CycleReport) -> bool {
        let tested: Vec<String> = built.iter().map(|r| r.image.clone()).collect();
        let failure = match self.backends.tester.test(built).await {
            Ok(()) => {
                self.ctx.record_tests(&tested, &[]);
                report.test = PhaseOutcome::Succeeded;
                return true;
            }
            Err(failure) => failure,
        };

        let (passed, failed) = split_failure(&tested, &failure);
        self.ctx.record_tests(&passed, &failed);

        let err = DevError::Test {
            failed,
            message: failure.message.clone(),
        };
        warn!(error = %err, "Tests failed");
        report.test = PhaseOutcome::Failed {
            error: failure.message,
        };
        report.with_error(err.to_string());

        let attributed = tested.iter().any(|name| failure.failed.contains(name));
        self.ctx.options().test_failure_policy == TestFailurePolicy::DeployUnaffected && attributed
    }

    /// Sync resync-eligible artifacts, returning those that must be rebuilt
    /// instead
    #[instrument(skip_all)]
    async fn sync_phase(&self, changes: &ChangeSet, report: &mut CycleReport) -> BTreeSet<String> {
        let mut fallback = BTreeSet::new();
        let mut hasher = InputHasher::new(&self.graph);

        for (name, files) in &changes.resync {
            let Some(current) = self.store.get(name) else {
                fallback.insert(name.clone());
                continue;
            };
            let changed: Vec<PathBuf> = files.iter().cloned().collect();
            let deleted = changes.deleted_for(name);

            let result = self
                .backends
                .syncer
                .sync(&current, &changed, &deleted)
                .await
                .map_err(|e| DevError::Sync {
                    artifact: name.clone(),
                    message: format!("{:#}", e),
                });

            match result {
                Ok(()) => {
                    match hasher.hash(name).await {
                        Ok(hash) => self.store.record_sync(name, hash),
                        Err(e) => warn!(artifact = %name, error = %e, "Failed to hash synced inputs"),
                    }
                    info!(artifact = %name, files = changed.len() + deleted.len(), "Synced files");
                    report.record(
                        name.clone(),
                        ArtifactOutcome::Synced {
                            files: changed.len() + deleted.len(),
                        },
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Sync failed, falling back to rebuild");
                    report.with_error(e.to_string());
                    fallback.insert(name.clone());
                }
            }
        }
        fallback
    }

    /// Build `names` wave by wave
    #[instrument(skip(self, report, cancel), fields(artifacts = names.len()))]
    async fn build_phase(
        &self,
        names: &BTreeSet<String>,
        iteration: u64,
        report: &mut CycleReport,
        cancel: &CancelToken,
    ) -> Result<BuildPhase, DevError> {
        let waves = self.graph.waves(names);
        debug!(waves = waves.len(), "Computed build waves");

        let semaphore = Arc::new(Semaphore::new(self.ctx.options().concurrency.max(1)));
        let run_id = self.ctx.run_id().to_string();
        let mut hasher = InputHasher::new(&self.graph);
        let mut phase = BuildPhase::default();
        let mut produced: BTreeMap<String, BuildResult> = BTreeMap::new();
        let mut fresh = false;

        for (wave_idx, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(wave = wave_idx, "Cancelled before wave");
                return Err(DevError::Cancelled);
            }
            debug!(wave = wave_idx, artifacts = wave.len(), "Building wave");

            let mut join_set: JoinSet<BuildTaskResult> = JoinSet::new();
            let mut launched = BTreeSet::new();

            for name in wave {
                let failed_dep = self
                    .graph
                    .direct_dependencies(name)
                    .into_iter()
                    .find(|dep| phase.failed.contains(dep));
                if let Some(dependency) = failed_dep {
                    let err = DevError::DependencyFailed {
                        artifact: name.clone(),
                        dependency: dependency.clone(),
                    };
                    warn!(error = %err, "Skipping build");
                    report.record(name.clone(), ArtifactOutcome::Skipped { dependency });
                    phase.failed.insert(name.clone());
                    continue;
                }

                if let Some(existing) = self.pinned_result(name) {
                    debug!(artifact = %name, tag = %existing.tag, "Reusing pinned result");
                    report.record(name.clone(), ArtifactOutcome::Cached { tag: existing.tag });
                    continue;
                }

                let job = match self.prepare_job(name, &mut hasher, &run_id, iteration).await {
                    Ok(job) => job,
                    Err(e) => {
                        error!(error = %e, "Failed to prepare build");
                        report.record(name.clone(), ArtifactOutcome::Failed { error: e.to_string() });
                        report.with_error(e.to_string());
                        phase.failed.insert(name.clone());
                        continue;
                    }
                };

                launched.insert(name.clone());
                let builder = self.backends.builder.clone();
                let cache = self.cache.clone();
                let store = self.store.clone();
                let semaphore = semaphore.clone();

                join_set.spawn(async move {
                    let name = job.artifact.name.clone();
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => build_one(job, builder.as_ref(), &cache, &store).await,
                        Err(e) => Err(anyhow::anyhow!("Build scheduler closed: {}", e)),
                    };
                    (name, result)
                });
            }

            let results = collect_join_results(join_set).await;
            let mut infrastructure = None;

            for name in &launched {
                let outcome = results
                    .get(name)
                    .map(|r| r.as_ref().map_err(|e| e.to_string()))
                    .unwrap_or_else(|| Err("build task panicked".to_string()));

                match outcome {
                    Ok((result, outcome)) => {
                        info!(artifact = %name, tag = %result.tag, "Build succeeded");
                        fresh |= matches!(
                            outcome,
                            ArtifactOutcome::Built { .. } | ArtifactOutcome::Retagged { .. }
                        );
                        report.record(name.clone(), outcome.clone());
                        produced.insert(name.clone(), result.clone());
                    }
                    Err(message) => {
                        let err = DevError::Build {
                            artifact: name.clone(),
                            message: message.clone(),
                        };
                        error!(error = %err, "Build failed");
                        report.record(name.clone(), ArtifactOutcome::Failed { error: message });
                        report.with_error(err.to_string());
                        phase.failed.insert(name.clone());
                    }
                }

                if let Some(Err(e)) = results.get(name) {
                    if let Some(infra) = e.downcast_ref::<InfrastructureError>() {
                        infrastructure = Some(infra.0.clone());
                    }
                }
            }

            if let Some(message) = infrastructure {
                return Err(DevError::Infrastructure(message));
            }
        }

        if fresh {
            self.ctx.mark_built();
        }
        phase.built = self
            .graph
            .build_order()
            .iter()
            .filter_map(|name| produced.remove(name))
            .collect();

        info!(
            built = phase.built.len(),
            failed = phase.failed.len(),
            "Build phase complete"
        );
        Ok(phase)
    }

    /// Existing result of an artifact pinned by the cache policy
    fn pinned_result(&self, name: &str) -> Option<BuildResult> {
        if self.cache.policy().is_no_rebuild(name) {
            self.store.get(name)
        } else {
            None
        }
    }

    async fn prepare_job(
        &self,
        name: &str,
        hasher: &mut InputHasher<'_>,
        run_id: &str,
        iteration: u64,
    ) -> Result<BuildJob, DevError> {
        let artifact = self
            .graph
            .artifact(name)
            .cloned()
            .ok_or_else(|| DevError::Build {
                artifact: name.to_string(),
                message: "unknown artifact".to_string(),
            })?;
        let input_hash = hasher.hash(name).await?;

        let image = self.apply_default_repo(name);
        let ctx = TagContext {
            image: &image,
            input_hash: &input_hash,
            run_id,
            iteration,
        };
        let tag = self
            .backends
            .tagger
            .tag(&artifact, &ctx)
            .map_err(|e| DevError::Build {
                artifact: name.to_string(),
                message: format!("Failed to tag: {:#}", e),
            })?;

        let dependencies = self
            .graph
            .direct_dependencies(name)
            .into_iter()
            .filter_map(|dep| self.store.get(&dep).map(|r| (dep, r.pinned_reference())))
            .collect();

        Ok(BuildJob {
            artifact,
            tag,
            input_hash,
            dependencies,
        })
    }

    /// Full current artifact set in build order. Artifacts whose tests
    /// failed fall back to their last deployed result.
    fn current_artifacts(&self) -> Vec<BuildResult> {
        let held = self.ctx.test_failed();
        self.graph
            .build_order()
            .iter()
            .filter_map(|name| {
                if held.contains(name) {
                    debug!(artifact = %name, "Holding back result with failed tests");
                    self.ctx.last_deployed(name)
                } else {
                    self.store.get(name)
                }
            })
            .collect()
    }

    async fn deploy(&self, artifacts: &[BuildResult]) -> Result<(), DevError> {
        info!(artifacts = artifacts.len(), "Deploying");
        self.backends
            .deployer
            .deploy(artifacts, &self.ctx.labels())
            .await
            .map_err(|e| classify(e, DevError::Deploy))?;
        self.ctx.mark_deployed(artifacts);
        Ok(())
    }

    /// Readiness check after a successful deploy; failures are reported only
    async fn check_status(&self, artifacts: &[BuildResult], report: &mut CycleReport) {
        let options = self.ctx.options();
        if !options.status_check {
            return;
        }
        let deadline = options.status_check_deadline;
        match tokio::time::timeout(deadline, self.backends.status.check(artifacts)).await {
            Ok(Ok(())) => debug!("Deployed resources are ready"),
            Ok(Err(e)) => {
                warn!(error = %e, "Status check failed");
                report.with_error(format!("Status check failed: {:#}", e));
            }
            Err(_) => {
                warn!(deadline = ?deadline, "Status check deadline exceeded");
                report.with_error(format!("Status check exceeded {:?}", deadline));
            }
        }
    }

    /// Refresh log and port-forward targets
    async fn post_deploy(&self, artifacts: &[BuildResult]) {
        self.selector.add(artifacts.iter().map(|r| r.tag.clone()));
        if let Err(e) = self.backends.tailer.follow(&self.selector.images()).await {
            warn!(error = %e, "Failed to follow deployed images");
        }
    }

    fn take_pending(&self) -> Pending {
        mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn put_pending(&self, deferred: Pending) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.changes.merge(deferred.changes);
        pending.deploy |= deferred.deploy;
        pending.untested.extend(deferred.untested);
    }

    fn publish(&self, report: &CycleReport) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(report.clone()).is_ok());
    }
}

/// Serve one artifact from the cache or the builder, recording the result.
///
/// Cache hits under a different tag are retagged through the builder; hits
/// without a digest, or whose retag fails, are rebuilt.
async fn build_one(
    job: BuildJob,
    builder: &dyn Builder,
    cache: &BuildCache,
    store: &ArtifactStore,
) -> anyhow::Result<(BuildResult, ArtifactOutcome)> {
    let name = job.artifact.name.clone();

    match cache.lookup(&name, &job.input_hash).await {
        CacheLookup::Hit(entry) if entry.result.tag == job.tag => {
            let tag = entry.result.tag.clone();
            store.adopt(entry.result.clone());
            return Ok((entry.result, ArtifactOutcome::Cached { tag }));
        }
        CacheLookup::Hit(entry) if entry.result.digest.is_none() => {
            debug!(artifact = %name, tag = %entry.result.tag, "Cached image has no digest, rebuilding");
        }
        CacheLookup::Hit(entry) => match builder.tag(&entry.result, &job.tag).await {
            Ok(()) => {
                let result = cache.retag(&entry.result, &job.tag);
                cache
                    .store(&name, &job.input_hash, result.clone(), entry.digest_source)
                    .await;
                store.record(result.clone());
                let tag = result.tag.clone();
                return Ok((result, ArtifactOutcome::Retagged { tag }));
            }
            Err(e) => {
                warn!(artifact = %name, error = %e, "Failed to retag cached image, rebuilding");
            }
        },
        CacheLookup::Miss(reason) => {
            debug!(artifact = %name, reason = ?reason, "Build cache miss");
        }
    }

    let request = BuildRequest {
        artifact: job.artifact,
        tag: job.tag,
        input_hash: job.input_hash.clone(),
        dependencies: job.dependencies,
    };
    let built = builder.build(&request).await?;
    let source = if built.pushed {
        DigestSource::Remote
    } else {
        DigestSource::Local
    };
    let result = BuildResult::new(name.clone(), built.tag.clone(), built.digest, job.input_hash.clone());
    cache.store(&name, &job.input_hash, result.clone(), source).await;
    store.record(result.clone());
    Ok((result, ArtifactOutcome::Built { tag: built.tag }))
}

/// Split tested artifacts into passed and failed. A failure naming none of
/// them counts against all of them.
fn split_failure(tested: &[String], failure: &TestFailure) -> (Vec<String>, Vec<String>) {
    let (failed, passed): (Vec<String>, Vec<String>) = tested
        .iter()
        .cloned()
        .partition(|name| failure.failed.contains(name));
    if failed.is_empty() {
        (Vec::new(), tested.to_vec())
    } else {
        (passed, failed)
    }
}

/// Collect build task results, logging tasks that panicked
async fn collect_join_results(
    mut join_set: JoinSet<BuildTaskResult>,
) -> BTreeMap<String, anyhow::Result<(BuildResult, ArtifactOutcome)>> {
    let mut results = BTreeMap::new();

    while let Some(join_result) = join_set.join_next().await {
        match join_result {
            Ok((name, result)) => {
                results.insert(name, result);
            }
            Err(e) => {
                error!(error = %e, "Build task panicked");
            }
        }
    }

    results
}

/// Map a collaborator error to a fatal infrastructure error or the given
/// non-fatal kind
fn classify(err: anyhow::Error, otherwise: impl FnOnce(String) -> DevError) -> DevError {
    match err.downcast_ref::<InfrastructureError>() {
        Some(infra) => DevError::Infrastructure(infra.0.clone()),
        None => otherwise(format!("{:#}", err)),
    }
}

fn log_report(report: &CycleReport) {
    let built = report
        .artifacts
        .values()
        .filter(|o| matches!(o, ArtifactOutcome::Built { .. }))
        .count();
    let cached = report
        .artifacts
        .values()
        .filter(|o| matches!(o, ArtifactOutcome::Cached { .. } | ArtifactOutcome::Retagged { .. }))
        .count();
    let synced = report
        .artifacts
        .values()
        .filter(|o| matches!(o, ArtifactOutcome::Synced { .. }))
        .count();
    let failed = report.artifacts.values().filter(|o| !o.is_success()).count();

    info!(
        iteration = report.iteration,
        built,
        cached,
        synced,
        failed,
        test = ?report.test,
        deploy = ?report.deploy,
        duration_ms = report.duration_ms,
        "Dev iteration complete"
    );
}
