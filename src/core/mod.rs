//! Core orchestration logic.
//!
//! This module contains:
//! - ArtifactGraph: Dependency graph and source ownership
//! - BuildCache: Content-addressable build results
//! - ArtifactStore: Latest result per artifact
//! - Reconciler: File events to change sets
//! - Intents: One-shot build/sync/deploy requests
//! - Runner: The dev loop

pub mod cache;
pub mod changeset;
pub mod context;
pub mod error;
pub mod graph;
pub mod hash;
pub mod images;
pub mod intents;
pub mod orchestrator;
pub mod store;

// Re-export commonly used types
pub use cache::{BuildCache, CacheBackend, CacheEntry, CacheLookup, CachePolicy, FileBackend, MemoryBackend, MissReason};
pub use changeset::Reconciler;
pub use context::{cancellation, CancelHandle, CancelToken, RunContext, RunOptions, TestFailurePolicy};
pub use error::{CacheError, DevError, GraphError};
pub use graph::{ArtifactGraph, SourceDependencies};
pub use hash::{digest_inputs, InputHasher};
pub use images::{apply_default_repo, ImageSelector};
pub use intents::{Intents, TakenIntents};
pub use orchestrator::{Backends, Runner};
pub use store::ArtifactStore;
