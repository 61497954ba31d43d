//! Project configuration (`devloop.yaml`).
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DEVLOOP_HOME, DEVLOOP_DEFAULT_REPO, DEVLOOP_NAMESPACE)
//! 2. Config file (devloop.yaml)
//! 3. Defaults (~/.devloop)
//!
//! Config file discovery:
//! - An explicit `--filename` wins
//! - Otherwise searches the current directory and parents for devloop.yaml
//! - Artifact contexts are relative to the config file's directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{DeployCommands, TagPolicy, TestCommand};
use crate::core::{CachePolicy, DevError, RunOptions, TestFailurePolicy};
use crate::domain::Artifact;

/// Config file name looked up during discovery
pub const CONFIG_FILE_NAME: &str = "devloop.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub test: Vec<TestConfig>,
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    #[serde(default)]
    pub dev: DevSettings,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub default_repo: Option<String>,
    #[serde(default)]
    pub test_failure_policy: TestFailurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub tag_policy: TagPolicy,
    /// Push images after building
    #[serde(default)]
    pub push: bool,
    /// Maximum concurrent builds (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Registries reached over plain HTTP when verifying cached images
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tag_policy: TagPolicy::default(),
            push: false,
            concurrency: default_concurrency(),
            insecure_registries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestConfig {
    pub image: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    pub command: String,
    #[serde(default)]
    pub render_command: Option<String>,
    #[serde(default)]
    pub cleanup_command: Option<String>,
    /// Wait for deployed resources to become ready (default: true)
    #[serde(default = "default_true")]
    pub status_check: bool,
    /// Readiness command run after a successful deploy
    #[serde(default)]
    pub status_command: Option<String>,
    #[serde(default = "default_status_deadline")]
    pub status_check_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevSettings {
    /// Quiet period before a batch of file events is processed (default: 500ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Longest a batch may keep growing (default: 5s)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Capacity of the file event queue (default: 256)
    #[serde(default = "default_trigger_queue")]
    pub trigger_queue: usize,
    #[serde(default = "default_true")]
    pub auto_build: bool,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default = "default_true")]
    pub auto_deploy: bool,
}

impl Default for DevSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_wait_ms: default_max_wait_ms(),
            trigger_queue: default_trigger_queue(),
            auto_build: true,
            auto_sync: true,
            auto_deploy: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    4
}
fn default_status_deadline() -> u64 {
    120
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_max_wait_ms() -> u64 {
    5000
}
fn default_trigger_queue() -> usize {
    256
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Parsed file with artifact contexts made absolute
    pub file: ConfigFile,
    /// Path to the config file
    pub config_file: PathBuf,
    /// Directory containing the config file
    pub root: PathBuf,
    /// Engine state directory
    pub home: PathBuf,
}

impl ResolvedConfig {
    /// Options snapshot for a run
    pub fn run_options(&self) -> RunOptions {
        let file = &self.file;
        let deploy = file.deploy.as_ref();
        RunOptions {
            namespace: file.namespace.clone(),
            default_repo: file.default_repo.clone(),
            cache: file.cache.clone(),
            tag_policy: file.build.tag_policy.clone(),
            concurrency: file.build.concurrency,
            debounce: Duration::from_millis(file.dev.debounce_ms),
            max_wait: Duration::from_millis(file.dev.max_wait_ms),
            push: file.build.push,
            test_failure_policy: file.test_failure_policy,
            status_check: deploy.map(|d| d.status_check).unwrap_or(false),
            status_check_deadline: Duration::from_secs(
                deploy
                    .map(|d| d.status_check_deadline_secs)
                    .unwrap_or_else(default_status_deadline),
            ),
            auto_build: file.dev.auto_build,
            auto_sync: file.dev.auto_sync,
            auto_deploy: file.dev.auto_deploy,
        }
    }

    /// Test commands bound to their images
    pub fn test_commands(&self) -> Vec<TestCommand> {
        self.file
            .test
            .iter()
            .map(|t| TestCommand {
                image: t.image.clone(),
                command: t.command.clone(),
            })
            .collect()
    }

    /// Deploy commands; empty when no deployer is configured
    pub fn deploy_commands(&self) -> DeployCommands {
        self.file
            .deploy
            .as_ref()
            .map(|d| DeployCommands {
                deploy: d.command.clone(),
                render: d.render_command.clone(),
                cleanup: d.cleanup_command.clone(),
                status: d.status_command.clone().filter(|_| d.status_check),
            })
            .unwrap_or_default()
    }

    /// Persistent cache file, if the cache policy names one
    pub fn cache_file(&self) -> Option<PathBuf> {
        self.file
            .cache
            .file
            .as_ref()
            .map(|f| resolve_path(&self.home, &f.to_string_lossy()))
    }

    /// Reject configurations the dev loop cannot run with
    pub fn validate(&self) -> Result<(), DevError> {
        let file = &self.file;
        if file.artifacts.is_empty() {
            return Err(DevError::Config("No artifacts declared".to_string()));
        }
        if file.build.concurrency == 0 {
            return Err(DevError::Config("build.concurrency must be at least 1".to_string()));
        }
        if file.dev.trigger_queue == 0 {
            return Err(DevError::Config("dev.trigger_queue must be at least 1".to_string()));
        }
        if file.dev.max_wait_ms < file.dev.debounce_ms {
            return Err(DevError::Config(
                "dev.max_wait_ms must not be shorter than dev.debounce_ms".to_string(),
            ));
        }
        for artifact in &file.artifacts {
            if !artifact.context.is_dir() {
                return Err(DevError::Config(format!(
                    "Context of '{}' is not a directory: {}",
                    artifact.name,
                    artifact.context.display()
                )));
            }
            for pattern in artifact.paths.iter().chain(artifact.sync.iter()) {
                glob::Pattern::new(pattern).map_err(|e| {
                    DevError::Config(format!("Invalid pattern '{}' in '{}': {}", pattern, artifact.name, e))
                })?;
            }
        }
        for test in &file.test {
            if !file.artifacts.iter().any(|a| a.name == test.image) {
                return Err(DevError::Config(format!("Test refers to unknown image '{}'", test.image)));
            }
        }
        for name in &file.cache.no_rebuild {
            if !file.artifacts.iter().any(|a| &a.name == name) {
                return Err(DevError::Config(format!("cache.no_rebuild names unknown image '{}'", name)));
            }
        }
        Ok(())
    }

    /// Apply environment overrides through `lookup`
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(repo) = lookup("DEVLOOP_DEFAULT_REPO") {
            self.file.default_repo = Some(repo);
        }
        if let Some(namespace) = lookup("DEVLOOP_NAMESPACE") {
            self.file.namespace = Some(namespace);
        }
    }
}

/// Engine state directory: $DEVLOOP_HOME or ~/.devloop
pub fn devloop_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("DEVLOOP_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".devloop"))
}

/// Find config file by searching the directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load the configuration from an explicit file or by discovery
pub fn load(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let config_file = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("Failed to determine current directory")?;
            find_config_file(&cwd).with_context(|| {
                format!("No {} found in {} or its parents", CONFIG_FILE_NAME, cwd.display())
            })?
        }
    };

    let mut file = load_config_file(&config_file)?;
    let root = config_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let root = resolve_path(&root, ".");

    for artifact in &mut file.artifacts {
        artifact.context = resolve_path(&root, &artifact.context.to_string_lossy());
    }

    let mut resolved = ResolvedConfig {
        file,
        config_file,
        root,
        home: devloop_home()?,
    };
    resolved.apply_env(|key| std::env::var(key).ok());
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
namespace: dev
default_repo: registry.io/team
artifacts:
  - image: base
    context: ./base
  - image: app
    context: ./app
    requires: [base]
    sync: ["static/**"]
    build_file: Dockerfile
build:
  tag_policy: session
  concurrency: 2
test:
  - image: app
    command: "go test ./..."
deploy:
  command: "kubectl apply -f k8s/"
  status_check_deadline_secs: 30
dev:
  debounce_ms: 200
cache:
  verify_remote: true
  no_rebuild: [base]
test_failure_policy: deploy_unaffected
"#;

    fn write_project(temp: &TempDir) -> PathBuf {
        std::fs::create_dir_all(temp.path().join("base")).unwrap();
        std::fs::create_dir_all(temp.path().join("app")).unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", SAMPLE).unwrap();
        path
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_project(&temp);

        let config = load(Some(&path)).unwrap();
        let file = &config.file;
        assert_eq!(file.artifacts.len(), 2);
        assert_eq!(file.artifacts[1].requires, vec!["base".to_string()]);
        assert!(file.artifacts[0].context.is_absolute());
        assert_eq!(file.build.tag_policy, TagPolicy::Session);
        assert_eq!(file.dev.max_wait_ms, 5000);
        assert!(file.cache.verify_remote);
        assert!(config.validate().is_ok());

        let options = config.run_options();
        assert_eq!(options.concurrency, 2);
        assert_eq!(options.debounce, Duration::from_millis(200));
        assert_eq!(options.status_check_deadline, Duration::from_secs(30));
        assert!(options.status_check);
        assert_eq!(options.test_failure_policy, TestFailurePolicy::DeployUnaffected);
    }

    #[test]
    fn test_discovery_walks_upward() {
        let temp = TempDir::new().unwrap();
        let path = write_project(&temp);
        let nested = temp.path().join("app").join("src");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(path));
    }

    #[test]
    fn test_env_overrides() {
        let temp = TempDir::new().unwrap();
        let path = write_project(&temp);
        let mut config = load(Some(&path)).unwrap();

        let env: HashMap<&str, &str> = [("DEVLOOP_DEFAULT_REPO", "gcr.io/other")].into();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.file.default_repo.as_deref(), Some("gcr.io/other"));
        assert_eq!(config.file.namespace.as_deref(), Some("dev"));
    }

    #[test]
    fn test_validation_rejects_unknown_test_image() {
        let temp = TempDir::new().unwrap();
        let path = write_project(&temp);
        let mut config = load(Some(&path)).unwrap();
        config.file.test.push(TestConfig {
            image: "ghost".to_string(),
            command: "true".to_string(),
        });

        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
