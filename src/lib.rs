//! devloop - Continuous build, test and deploy for container workspaces
//!
//! Watches a workspace, works out which artifacts a change affects and
//! drives them through build, test and deploy, reusing cached images
//! wherever their inputs are unchanged.
//!
//! # Architecture
//!
//! The system is built around a single orchestrator task:
//! - File events arrive over a bounded channel and are debounced
//! - Each batch is reconciled into a change set (rebuild, resync, deploy)
//! - Independent artifacts build concurrently, wave by wave
//! - Every cycle produces a report, whether or not anything happened
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits and command-line backends
//! - `core`: Orchestration logic (ArtifactGraph, BuildCache, Runner)
//! - `domain`: Data structures (Artifact, BuildResult, ChangeSet)
//! - `watch`: File monitoring and debouncing
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Build everything once
//! devloop build --file-output builds.json
//!
//! # Deploy a previous build
//! devloop apply --build-artifacts builds.json
//!
//! # Watch and redeploy on change
//! devloop dev
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod watch;

// Re-export main types at crate root for convenience
pub use core::{ArtifactGraph, Backends, BuildCache, DevError, RunContext, RunOptions, Runner};
pub use domain::{Artifact, BuildResult, ChangeSet, CycleReport, FileEvent, InputHash};
