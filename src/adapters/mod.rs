//! Collaborator contracts consumed by the orchestrator.
//!
//! The core depends only on these traits. Concrete backends live in the
//! submodules and are wired up by the CLI; tests substitute recording fakes.

pub mod command;
pub mod registry;
pub mod resolver;
pub mod tagger;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Artifact, BuildResult, InputHash};

pub use command::{CommandBuilder, CommandDeployer, CommandTester, DeployCommands, TestCommand};
pub use registry::RegistryVerifier;
pub use resolver::GlobResolver;
pub use tagger::{tagger_for, InputDigestTagger, LiteralTagger, SessionTagger, TagPolicy};

/// Request handed to the builder for one artifact
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// The artifact to build
    pub artifact: Artifact,

    /// Image reference the result must carry
    pub tag: String,

    /// Input hash the build corresponds to
    pub input_hash: InputHash,

    /// Current image references of the artifacts it requires
    pub dependencies: BTreeMap<String, String>,
}

/// Image produced by the builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Image reference
    pub tag: String,

    /// Digest, when the backend knows it
    pub digest: Option<String>,

    /// Whether the image was pushed to a registry
    pub pushed: bool,
}

/// Builds images. Must be safe to call for any subset of artifacts; the
/// orchestrator fans independent artifacts out concurrently.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Human-readable builder name
    fn name(&self) -> &str;

    /// Build a single artifact
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage>;

    /// Make the image of `existing` available under `tag`
    async fn tag(&self, existing: &BuildResult, tag: &str) -> Result<()>;

    /// Remove images built during this session
    async fn prune(&self, tags: &[String]) -> Result<()>;
}

/// Test failure, naming the artifacts whose tests failed
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TestFailure {
    /// Failing artifacts; empty means "could not attribute"
    pub failed: Vec<String>,
    pub message: String,
}

/// Runs tests against freshly built artifacts
#[async_trait]
pub trait Tester: Send + Sync {
    async fn test(&self, built: &[BuildResult]) -> std::result::Result<(), TestFailure>;
}

/// Deploys the full current artifact set
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Apply manifests referencing `artifacts`
    async fn deploy(&self, artifacts: &[BuildResult], labels: &BTreeMap<String, String>)
        -> Result<()>;

    /// Render manifests without applying them
    async fn render(&self, artifacts: &[BuildResult], labels: &BTreeMap<String, String>)
        -> Result<String>;

    /// Delete deployed resources
    async fn cleanup(&self) -> Result<()>;
}

/// Copies changed files into running containers
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(&self, artifact: &BuildResult, changed: &[PathBuf], deleted: &[PathBuf])
        -> Result<()>;
}

/// Context available to a tagger
#[derive(Debug, Clone)]
pub struct TagContext<'a> {
    /// Image name with the default repo applied
    pub image: &'a str,

    /// Input hash of the artifact
    pub input_hash: &'a InputHash,

    /// Process-wide run identifier
    pub run_id: &'a str,

    /// Current dev iteration
    pub iteration: u64,
}

/// Produces the next image reference for an artifact
pub trait Tagger: Send + Sync {
    fn tag(&self, artifact: &Artifact, ctx: &TagContext<'_>) -> Result<String>;
}

/// Polls deployed resources for readiness
#[async_trait]
pub trait StatusChecker: Send + Sync {
    async fn check(&self, deployed: &[BuildResult]) -> Result<()>;
}

/// Follows logs/port-forwards for a set of images
#[async_trait]
pub trait LogTailer: Send + Sync {
    async fn follow(&self, images: &[String]) -> Result<()>;
    async fn stop(&self);
}

/// Confirms an image still exists in its registry
#[async_trait]
pub trait ImageVerifier: Send + Sync {
    async fn exists(&self, tag: &str) -> Result<bool>;
}

/// Resolves which files belong to an artifact
pub trait SourceResolver: Send + Sync {
    /// All source files of an artifact
    fn resolve(&self, artifact: &Artifact) -> Result<Vec<PathBuf>>;

    /// Whether `path` would be part of the artifact's sources, even if it
    /// did not exist when sources were last resolved
    fn matches(&self, artifact: &Artifact, path: &Path) -> bool;
}

/// Marks an error as fatal to the dev loop (cluster unreachable, etc.)
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct InfrastructureError(pub String);

/// Status checker used when readiness checks are disabled
pub struct NoopStatusChecker;

#[async_trait]
impl StatusChecker for NoopStatusChecker {
    async fn check(&self, _deployed: &[BuildResult]) -> Result<()> {
        Ok(())
    }
}

/// Log tailer that only records what it would follow
pub struct TracingTailer;

#[async_trait]
impl LogTailer for TracingTailer {
    async fn follow(&self, images: &[String]) -> Result<()> {
        tracing::info!(images = ?images, "Following deployed images");
        Ok(())
    }

    async fn stop(&self) {}
}

/// Syncer for setups without live sync; every sync falls back to a rebuild
pub struct UnsupportedSyncer;

#[async_trait]
impl Syncer for UnsupportedSyncer {
    async fn sync(&self, artifact: &BuildResult, _changed: &[PathBuf], _deleted: &[PathBuf])
        -> Result<()> {
        anyhow::bail!("No syncer configured for '{}'", artifact.image)
    }
}
