//! Artifacts declared in the project configuration.
//!
//! An artifact is one buildable, deployable unit (usually a container image)
//! rooted at a workspace directory, with declared dependencies on other
//! artifacts and glob patterns selecting its source files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

/// A single buildable/deployable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Image name (unique within the project)
    #[serde(rename = "image")]
    pub name: String,

    /// Workspace directory (resolved against the config file location)
    #[serde(default = "default_context")]
    pub context: PathBuf,

    /// Names of other artifacts this one is built on top of
    #[serde(default)]
    pub requires: Vec<String>,

    /// Glob patterns (relative to the context) selecting source files
    #[serde(default = "default_paths")]
    pub paths: Vec<String>,

    /// Glob patterns for files that can be copied into a running
    /// container instead of triggering a rebuild
    #[serde(default)]
    pub sync: Vec<String>,

    /// Build definition file (e.g. `Dockerfile`); changing it refreshes
    /// the resolved source set
    #[serde(default)]
    pub build_file: Option<String>,

    /// How the external builder should build this artifact
    #[serde(default)]
    pub build: BuildSpec,
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_paths() -> Vec<String> {
    vec!["**/*".to_string()]
}

/// Backend-specific build settings, opaque to the orchestrator except
/// that they participate in the input hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Shell command used by the command builder
    #[serde(default)]
    pub command: Option<String>,

    /// Build arguments
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl Artifact {
    /// Create an artifact with default source patterns
    pub fn new(name: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            context: context.into(),
            requires: Vec::new(),
            paths: default_paths(),
            sync: Vec::new(),
            build_file: None,
            build: BuildSpec::default(),
        }
    }

    /// Declare artifact dependencies
    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the source patterns
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Declare live-sync patterns
    pub fn with_sync<I, S>(mut self, sync: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sync = sync.into_iter().map(Into::into).collect();
        self
    }

    /// Set the build file
    pub fn with_build_file(mut self, build_file: impl Into<String>) -> Self {
        self.build_file = Some(build_file.into());
        self
    }

    /// Set the build command
    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build.command = Some(command.into());
        self
    }

    /// Whether any files of this artifact can be synced without a rebuild
    pub fn supports_sync(&self) -> bool {
        !self.sync.is_empty()
    }

    /// Path relative to the artifact's context, if it lives under it
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.context).ok()
    }

    /// Whether `path` matches one of the declared source patterns
    pub fn matches_source(&self, path: &Path) -> bool {
        self.relative(path)
            .map(|rel| matches_any(&self.paths, rel) || self.is_build_file(path))
            .unwrap_or(false)
    }

    /// Whether `path` is whitelisted for live sync
    pub fn is_sync_eligible(&self, path: &Path) -> bool {
        self.relative(path)
            .map(|rel| matches_any(&self.sync, rel))
            .unwrap_or(false)
    }

    /// Whether `path` is this artifact's build file
    pub fn is_build_file(&self, path: &Path) -> bool {
        match (&self.build_file, self.relative(path)) {
            (Some(build_file), Some(rel)) => rel == Path::new(build_file),
            _ => false,
        }
    }
}

fn matches_any(patterns: &[String], rel: &Path) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    patterns.iter().any(|p| {
        Pattern::new(p)
            .map(|pattern| pattern.matches_path_with(rel, options))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_yaml_defaults() {
        let yaml = r#"
image: app
context: ./app
requires: [base]
"#;
        let artifact: Artifact = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(artifact.name, "app");
        assert_eq!(artifact.requires, vec!["base".to_string()]);
        assert_eq!(artifact.paths, vec!["**/*".to_string()]);
        assert!(!artifact.supports_sync());
    }

    #[test]
    fn test_sync_eligibility() {
        let artifact = Artifact::new("web", "/ws/web").with_sync(["static/**/*.css", "*.html"]);

        assert!(artifact.is_sync_eligible(Path::new("/ws/web/static/css/site.css")));
        assert!(artifact.is_sync_eligible(Path::new("/ws/web/index.html")));
        assert!(!artifact.is_sync_eligible(Path::new("/ws/web/src/main.rs")));
        assert!(!artifact.is_sync_eligible(Path::new("/ws/other/index.html")));
    }

    #[test]
    fn test_build_file_detection() {
        let artifact = Artifact::new("app", "/ws/app").with_build_file("Dockerfile");

        assert!(artifact.is_build_file(Path::new("/ws/app/Dockerfile")));
        assert!(!artifact.is_build_file(Path::new("/ws/app/src/Dockerfile")));
        assert!(artifact.matches_source(Path::new("/ws/app/Dockerfile")));
    }

    #[test]
    fn test_source_patterns_scope_to_context() {
        let artifact = Artifact::new("app", "/ws/app").with_paths(["src/**/*.rs"]);

        assert!(artifact.matches_source(Path::new("/ws/app/src/lib.rs")));
        assert!(artifact.matches_source(Path::new("/ws/app/src/a/b.rs")));
        assert!(!artifact.matches_source(Path::new("/ws/app/README.md")));
        assert!(!artifact.matches_source(Path::new("/ws/base/src/lib.rs")));
    }
}
