//! Error taxonomy for the dev loop.
//!
//! Graph, configuration and infrastructure errors are fatal: they stop the
//! loop (or prevent it from starting). Everything else is reported for the
//! current cycle and the loop keeps watching.

use thiserror::Error;

/// Errors raised while loading the artifact graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Artifact '{artifact}' requires unknown artifact '{reference}'")]
    UnresolvedReference { artifact: String, reference: String },

    #[error("Duplicate artifact: {0}")]
    DuplicateArtifact(String),

    #[error("Artifact name cannot be empty")]
    EmptyName,

    #[error("Unknown artifact: {0}")]
    UnknownArtifact(String),

    #[error("Failed to resolve sources for '{artifact}': {message}")]
    Resolve { artifact: String, message: String },
}

/// Errors raised by a build cache backend
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the orchestrator
#[derive(Debug, Error)]
pub enum DevError {
    #[error("Invalid artifact graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Build failed for '{artifact}': {message}")]
    Build { artifact: String, message: String },

    #[error("Skipped '{artifact}': dependency '{dependency}' failed")]
    DependencyFailed { artifact: String, dependency: String },

    #[error("Build cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Tests failed for [{}]: {message}", .failed.join(", "))]
    Test { failed: Vec<String>, message: String },

    #[error("Deploy failed: {0}")]
    Deploy(String),

    #[error("Sync failed for '{artifact}': {message}")]
    Sync { artifact: String, message: String },

    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("Cancelled")]
    Cancelled,
}

impl DevError {
    /// Whether this error terminates the dev loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Graph(_) | Self::Config(_) | Self::Infrastructure(_))
    }
}

impl From<CacheError> for DevError {
    fn from(err: CacheError) -> Self {
        Self::CacheUnavailable(err.to_string())
    }
}
