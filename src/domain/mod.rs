//! Domain types for the devloop orchestrator.
//!
//! This module contains the core data structures:
//! - Artifact: Declared buildable units
//! - BuildResult: Produced images and their input hashes
//! - ChangeSet: Per-cycle rebuild/resync plan
//! - CycleReport: Per-cycle outcome

pub mod artifact;
pub mod build;
pub mod changes;
pub mod report;

// Re-export commonly used types
pub use artifact::{Artifact, BuildSpec};
pub use build::{BuildOutput, BuildResult, DigestSource, InputHash};
pub use changes::{ChangeSet, FileEvent, FileEventKind};
pub use report::{ArtifactOutcome, CycleReport, PhaseOutcome, Trigger};
