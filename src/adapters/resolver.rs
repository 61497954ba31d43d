//! Glob-based source resolution.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::MatchOptions;

use crate::domain::Artifact;

use super::SourceResolver;

/// Resolves an artifact's sources by expanding its `paths` globs under its
/// context directory. The build file always belongs to the set.
pub struct GlobResolver;

impl SourceResolver for GlobResolver {
    fn resolve(&self, artifact: &Artifact) -> Result<Vec<PathBuf>> {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let mut files = Vec::new();
        for pattern in &artifact.paths {
            let full = artifact.context.join(pattern);
            let full = full.to_string_lossy();
            let entries = glob::glob_with(&full, options)
                .with_context(|| format!("Invalid source pattern '{}' for '{}'", pattern, artifact.name))?;

            for entry in entries {
                let path = entry.with_context(|| format!("Failed to read sources of '{}'", artifact.name))?;
                if path.is_file() {
                    files.push(path);
                }
            }
        }

        if let Some(build_file) = &artifact.build_file {
            let path = artifact.context.join(build_file);
            if path.is_file() {
                files.push(path);
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }

    fn matches(&self, artifact: &Artifact, path: &Path) -> bool {
        artifact.matches_source(path)
    }
}
