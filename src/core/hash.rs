//! Input hash computation.
//!
//! An artifact's input hash covers its build definition, the content of its
//! resolved source files and the input hashes of its direct dependencies, so
//! a change anywhere below an artifact changes its hash too. The artifact's
//! own name is not hashed: identical declared content with identical
//! dependency hashes yields identical input hashes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::domain::{Artifact, InputHash};

use super::error::{DevError, GraphError};
use super::graph::ArtifactGraph;

const HASH_VERSION: &[u8] = b"devloop-input/v1\0";

/// Hash a file's content (hex SHA-256)
pub async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let content = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// Digest an artifact's inputs given its resolved files and the input
/// hashes of its direct dependencies
pub async fn digest_inputs(
    artifact: &Artifact,
    files: &BTreeSet<PathBuf>,
    dependencies: &BTreeMap<String, InputHash>,
) -> Result<InputHash, std::io::Error> {
    let mut hasher = Sha256::new();
    hasher.update(HASH_VERSION);

    let spec = serde_json::to_vec(&artifact.build)?;
    hasher.update(&spec);
    hasher.update(b"\0");
    if let Some(build_file) = &artifact.build_file {
        hasher.update(build_file.as_bytes());
    }
    hasher.update(b"\0");

    for file in files {
        let content_hash = match hash_file(file).await {
            Ok(hash) => hash,
            // Deleted since the last resolve
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let rel = artifact.relative(file).unwrap_or(file);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(content_hash.as_bytes());
        hasher.update(b"\n");
    }

    for (name, hash) in dependencies {
        hasher.update(b"dep:");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(hash.0.as_bytes());
        hasher.update(b"\n");
    }

    Ok(InputHash(hex::encode(hasher.finalize())))
}

/// Memoizing input hash calculator for one cycle
pub struct InputHasher<'a> {
    graph: &'a ArtifactGraph,
    memo: BTreeMap<String, InputHash>,
}

impl<'a> InputHasher<'a> {
    pub fn new(graph: &'a ArtifactGraph) -> Self {
        Self {
            graph,
            memo: BTreeMap::new(),
        }
    }

    /// Input hash of `name`, computing its dependencies first
    pub async fn hash(&mut self, name: &str) -> Result<InputHash, DevError> {
        if let Some(hash) = self.memo.get(name) {
            return Ok(hash.clone());
        }
        let graph = self.graph;
        if !graph.contains(name) {
            return Err(GraphError::UnknownArtifact(name.to_string()).into());
        }

        let mut needed = graph.dependencies(name);
        needed.insert(name.to_string());

        let pending: Vec<String> = graph
            .build_order()
            .iter()
            .filter(|n| needed.contains(*n) && !self.memo.contains_key(*n))
            .cloned()
            .collect();

        for current in pending {
            let artifact = graph
                .artifact(&current)
                .ok_or_else(|| GraphError::UnknownArtifact(current.clone()))?;

            let mut deps = BTreeMap::new();
            for dep in graph.direct_dependencies(&current) {
                if let Some(hash) = self.memo.get(&dep) {
                    deps.insert(dep, hash.clone());
                }
            }

            let files = graph.source_files(&current).map_err(|e| DevError::Build {
                artifact: current.clone(),
                message: e.to_string(),
            })?;
            let hash = digest_inputs(artifact, &files, &deps)
                .await
                .map_err(|e| DevError::Build {
                    artifact: current.clone(),
                    message: format!("Failed to hash inputs: {}", e),
                })?;

            trace!(artifact = %current, hash = %hash.short(), "Computed input hash");
            self.memo.insert(current, hash);
        }

        self.memo
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownArtifact(name.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_identical_content_identical_hash() {
        let temp = TempDir::new().unwrap();
        let a_dir = temp.path().join("a");
        let b_dir = temp.path().join("b");
        std::fs::create_dir_all(&a_dir).unwrap();
        std::fs::create_dir_all(&b_dir).unwrap();
        std::fs::write(a_dir.join("main.go"), "package main").unwrap();
        std::fs::write(b_dir.join("main.go"), "package main").unwrap();

        let a = Artifact::new("a", &a_dir);
        let b = Artifact::new("b", &b_dir);
        let a_files: BTreeSet<PathBuf> = [a_dir.join("main.go")].into();
        let b_files: BTreeSet<PathBuf> = [b_dir.join("main.go")].into();

        let deps = BTreeMap::new();
        let hash_a = digest_inputs(&a, &a_files, &deps).await.unwrap();
        let hash_b = digest_inputs(&b, &b_files, &deps).await.unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.0.len(), 64);
    }

    #[tokio::test]
    async fn test_content_and_dependencies_change_hash() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("main.go");
        std::fs::write(&file, "v1").unwrap();

        let artifact = Artifact::new("app", temp.path());
        let files: BTreeSet<PathBuf> = [file.clone()].into();

        let none = BTreeMap::new();
        let first = digest_inputs(&artifact, &files, &none).await.unwrap();

        let with_dep: BTreeMap<String, InputHash> =
            [("base".to_string(), InputHash("00".repeat(32)))].into();
        let second = digest_inputs(&artifact, &files, &with_dep).await.unwrap();
        assert_ne!(first, second);

        std::fs::write(&file, "v2").unwrap();
        let third = digest_inputs(&artifact, &files, &none).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_missing_files_are_skipped() {
        let temp = TempDir::new().unwrap();
        let artifact = Artifact::new("app", temp.path());

        let empty = BTreeSet::new();
        let ghost: BTreeSet<PathBuf> = [temp.path().join("gone.txt")].into();

        let deps = BTreeMap::new();
        assert_eq!(
            digest_inputs(&artifact, &empty, &deps).await.unwrap(),
            digest_inputs(&artifact, &ghost, &deps).await.unwrap()
        );
    }
}
