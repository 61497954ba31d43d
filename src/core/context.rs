//! Run context: the immutable options of one process run plus the few
//! pieces of run state that change under synchronization.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::adapters::TagPolicy;
use crate::domain::BuildResult;

use super::cache::CachePolicy;

/// Label carrying the run identifier
pub const RUN_ID_LABEL: &str = "devloop.dev/run-id";

/// Label marking resources managed by this tool
pub const MANAGED_BY_LABEL: &str = "devloop.dev/managed-by";

/// What to deploy when tests fail for some artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFailurePolicy {
    /// Skip the deploy entirely
    #[default]
    WithholdDeploy,

    /// Deploy everything except the failing artifacts, which keep their
    /// last deployed result
    DeployUnaffected,
}

/// Immutable options for a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub namespace: Option<String>,
    pub default_repo: Option<String>,
    pub cache: CachePolicy,
    pub tag_policy: TagPolicy,

    /// Maximum concurrent builds within a wave
    pub concurrency: usize,

    /// Quiet period before a batch of file events is flushed
    pub debounce: Duration,

    /// Upper bound on how long a batch can keep growing
    pub max_wait: Duration,

    pub push: bool,
    pub test_failure_policy: TestFailurePolicy,

    /// Run the status checker after a successful deploy
    pub status_check: bool,
    pub status_check_deadline: Duration,

    pub auto_build: bool,
    pub auto_sync: bool,
    pub auto_deploy: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            default_repo: None,
            cache: CachePolicy::default(),
            tag_policy: TagPolicy::default(),
            concurrency: 4,
            debounce: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
            push: false,
            test_failure_policy: TestFailurePolicy::default(),
            status_check: true,
            status_check_deadline: Duration::from_secs(120),
            auto_build: true,
            auto_sync: true,
            auto_deploy: true,
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    /// Results handed to the last successful deploy
    last_deployed: BTreeMap<String, BuildResult>,
    last_deploy_at: Option<DateTime<Utc>>,

    /// Artifacts whose latest result failed its tests
    test_failed: BTreeSet<String>,
}

/// Process-wide context, constructed once at startup
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    options: RunOptions,
    state: Mutex<RunState>,
    has_built: AtomicBool,
    has_deployed: AtomicBool,
    iteration: AtomicU64,
}

impl RunContext {
    pub fn new(options: RunOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            options,
            state: Mutex::new(RunState::default()),
            has_built: AtomicBool::new(false),
            has_deployed: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Labels attached to every deployed resource
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (RUN_ID_LABEL.to_string(), self.run_id.to_string()),
            (MANAGED_BY_LABEL.to_string(), "devloop".to_string()),
        ])
    }

    pub fn has_built(&self) -> bool {
        self.has_built.load(Ordering::SeqCst)
    }

    pub fn has_deployed(&self) -> bool {
        self.has_deployed.load(Ordering::SeqCst)
    }

    /// Set once, never reset
    pub fn mark_built(&self) {
        self.has_built.store(true, Ordering::SeqCst);
    }

    /// Record a successful deploy of `results`
    pub fn mark_deployed(&self, results: &[BuildResult]) {
        self.has_deployed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_deployed = results
            .iter()
            .map(|r| (r.image.clone(), r.clone()))
            .collect();
        state.last_deploy_at = Some(Utc::now());
    }

    /// Result of an artifact as it was last deployed
    pub fn last_deployed(&self, name: &str) -> Option<BuildResult> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_deployed
            .get(name)
            .cloned()
    }

    /// Record test outcomes. Failed artifacts stay held back from deploys
    /// until a later result of them passes.
    pub fn record_tests(&self, passed: &[String], failed: &[String]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for name in passed {
            state.test_failed.remove(name);
        }
        state.test_failed.extend(failed.iter().cloned());
    }

    /// Artifacts held back from deploys by failed tests
    pub fn test_failed(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .test_failed
            .clone()
    }

    pub fn last_deploy_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_deploy_at
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::SeqCst)
    }

    /// Advance the dev iteration, returning the new value
    pub fn next_iteration(&self) -> u64 {
        self.iteration.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Create a linked cancellation handle and token
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

/// Cancels every token created alongside it
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Observes cancellation at safe checkpoints
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn none() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolve once cancelled. Never resolves if the handle was dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_never_reset() {
        let ctx = RunContext::new(RunOptions::default());
        assert!(!ctx.has_built());
        assert!(!ctx.has_deployed());

        ctx.mark_built();
        ctx.mark_deployed(&[]);
        ctx.mark_deployed(&[]);

        assert!(ctx.has_built());
        assert!(ctx.has_deployed());
        assert!(ctx.last_deploy_at().is_some());
    }

    #[test]
    fn test_failed_tests_held_until_passing() {
        let ctx = RunContext::new(RunOptions::default());
        let app = vec!["app".to_string()];
        let web = vec!["web".to_string()];

        ctx.record_tests(&web, &app);
        assert_eq!(ctx.test_failed(), BTreeSet::from(["app".to_string()]));

        // Unrelated passes keep it held
        ctx.record_tests(&web, &[]);
        assert!(ctx.test_failed().contains("app"));

        ctx.record_tests(&app, &[]);
        assert!(ctx.test_failed().is_empty());
    }

    #[test]
    fn test_labels_carry_run_id() {
        let ctx = RunContext::new(RunOptions::default());
        let labels = ctx.labels();
        assert_eq!(labels[RUN_ID_LABEL], ctx.run_id().to_string());
        assert_eq!(labels[MANAGED_BY_LABEL], "devloop");
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (handle, token) = cancellation();
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
        assert!(handle.token().is_cancelled());
        assert!(!CancelToken::none().is_cancelled());
    }
}
