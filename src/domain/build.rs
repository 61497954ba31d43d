//! Build results and input hashes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content digest over an artifact's resolved inputs (hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputHash(pub String);

impl InputHash {
    /// Abbreviated form used in tags and log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for InputHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of building (or reusing) an artifact's image.
///
/// Results are never mutated once produced; a rebuild supersedes the
/// previous result in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    /// Artifact (image) name
    pub image: String,

    /// Fully qualified image reference, e.g. `registry/app:3f2a9c`
    pub tag: String,

    /// Image digest, when the builder reported one
    pub digest: Option<String>,

    /// Input hash the image was built from
    pub input_hash: InputHash,

    /// When the image was produced
    pub built_at: DateTime<Utc>,
}

impl BuildResult {
    /// Create a result stamped with the current time
    pub fn new(
        image: impl Into<String>,
        tag: impl Into<String>,
        digest: Option<String>,
        input_hash: InputHash,
    ) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
            digest,
            input_hash,
            built_at: Utc::now(),
        }
    }

    /// Reference pinned to the digest when known (`repo:tag@sha256:...`)
    pub fn pinned_reference(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.tag, digest),
            None => self.tag.clone(),
        }
    }
}

/// Where a cached image's digest was confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestSource {
    /// Present in the local image store
    Local,

    /// Pushed to and confirmed by the remote registry
    Remote,

    /// Never verified
    Unknown,
}

/// Entry written to `--file-output` and read back by `deploy`/`apply`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub image: String,
    pub tag: String,
}

impl From<&BuildResult> for BuildOutput {
    fn from(result: &BuildResult) -> Self {
        Self {
            image: result.image.clone(),
            tag: result.pinned_reference(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        let hash = InputHash("0123456789abcdef0123".to_string());
        assert_eq!(hash.short(), "0123456789ab");

        let tiny = InputHash("abc".to_string());
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_pinned_reference() {
        let hash = InputHash("ff".repeat(32));
        let unpinned = BuildResult::new("app", "repo/app:v1", None, hash.clone());
        assert_eq!(unpinned.pinned_reference(), "repo/app:v1");

        let pinned = BuildResult::new("app", "repo/app:v1", Some("sha256:abc".to_string()), hash);
        assert_eq!(pinned.pinned_reference(), "repo/app:v1@sha256:abc");
    }

    #[test]
    fn test_build_output_serialization() {
        let result = BuildResult::new("app", "repo/app:v1", None, InputHash("aa".to_string()));
        let json = serde_json::to_string(&vec![BuildOutput::from(&result)]).unwrap();
        let parsed: Vec<BuildOutput> = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed[0].image, "app");
        assert_eq!(parsed[0].tag, "repo/app:v1");
    }
}
