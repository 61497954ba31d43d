//! Shell-command backends.
//!
//! Each backend runs a configured command through `sh -c` and passes the
//! images it operates on through the environment:
//! - `IMAGE`: the image reference being built or tested
//! - `IMAGES`: space-separated `name=reference` pairs
//! - `NAMESPACE`: target namespace, when configured

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::domain::BuildResult;

use super::{
    BuildRequest, BuiltImage, Builder, Deployer, InfrastructureError, StatusChecker, TestFailure,
    Tester,
};

/// Output of a finished shell command
#[derive(Debug)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` with `sh -c`, failing on a non-zero exit or timeout
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    limit: Duration,
) -> Result<ShellOutput> {
    debug!(command, cwd = %cwd.display(), "Running command");

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", command))?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .with_context(|| format!("Command '{}' timed out after {:?}", command, limit))?
        .with_context(|| format!("Failed to wait for '{}'", command))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!(
            "Command '{}' failed with exit code {}: {}",
            command,
            exit_code,
            stderr.trim()
        );
    }

    Ok(ShellOutput { stdout, stderr })
}

/// `name=reference` pairs for the `IMAGES` variable
pub fn images_env(results: &[BuildResult]) -> String {
    results
        .iter()
        .map(|r| format!("{}={}", r.image, r.pinned_reference()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last `sha256:` token printed by a build
fn parse_digest(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .rev()
        .find_map(|word| {
            let start = word.find("sha256:")?;
            let digest: String = word[start..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == ':')
                .collect();
            (digest.len() == "sha256:".len() + 64).then_some(digest)
        })
}

/// Messages that mean the cluster itself is unreachable
fn is_unreachable(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("unable to connect to the server") || lower.contains("connection refused")
}

/// Builds images with each artifact's `build.command`, defaulting to
/// `docker build`
pub struct CommandBuilder {
    push: bool,
    namespace: Option<String>,
    timeout: Duration,

    /// Applies `$IMAGE` to the existing image `$SOURCE`
    tag_command: String,
}

impl CommandBuilder {
    pub fn new(push: bool, namespace: Option<String>) -> Self {
        Self {
            push,
            namespace,
            timeout: Duration::from_secs(1800),
            tag_command: "docker tag \"$SOURCE\" \"$IMAGE\"".to_string(),
        }
    }

    pub fn with_tag_command(mut self, command: impl Into<String>) -> Self {
        self.tag_command = command.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_for(request: &BuildRequest) -> String {
        if let Some(command) = &request.artifact.build.command {
            return command.clone();
        }
        match &request.artifact.build_file {
            Some(file) => format!("docker build -t \"$IMAGE\" -f '{}' .", file),
            None => "docker build -t \"$IMAGE\" .".to_string(),
        }
    }

    fn env(&self, request: &BuildRequest) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = request.artifact.build.args.clone();
        env.insert("IMAGE".to_string(), request.tag.clone());
        env.insert("INPUT_HASH".to_string(), request.input_hash.0.clone());
        env.insert(
            "IMAGES".to_string(),
            request
                .dependencies
                .iter()
                .map(|(name, tag)| format!("{}={}", name, tag))
                .collect::<Vec<_>>()
                .join(" "),
        );
        if let Some(ns) = &self.namespace {
            env.insert("NAMESPACE".to_string(), ns.clone());
        }
        env
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    fn name(&self) -> &str {
        "command"
    }

    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage> {
        let command = Self::command_for(request);
        let env = self.env(request);
        let cwd = &request.artifact.context;

        let output = run_shell(&command, cwd, &env, self.timeout)
            .await
            .with_context(|| format!("Failed to build '{}'", request.artifact.name))?;
        let mut digest = parse_digest(&output.stdout).or_else(|| parse_digest(&output.stderr));

        if self.push {
            let pushed = run_shell("docker push \"$IMAGE\"", cwd, &env, self.timeout)
                .await
                .with_context(|| format!("Failed to push '{}'", request.tag))?;
            digest = parse_digest(&pushed.stdout).or(digest);
        }

        Ok(BuiltImage {
            tag: request.tag.clone(),
            digest,
            pushed: self.push,
        })
    }

    async fn tag(&self, existing: &BuildResult, tag: &str) -> Result<()> {
        let mut env = BTreeMap::from([
            ("SOURCE".to_string(), existing.pinned_reference()),
            ("IMAGE".to_string(), tag.to_string()),
        ]);
        if let Some(ns) = &self.namespace {
            env.insert("NAMESPACE".to_string(), ns.clone());
        }
        let cwd = Path::new(".");

        run_shell(&self.tag_command, cwd, &env, self.timeout)
            .await
            .with_context(|| format!("Failed to tag '{}' as '{}'", existing.tag, tag))?;
        if self.push {
            run_shell("docker push \"$IMAGE\"", cwd, &env, self.timeout)
                .await
                .with_context(|| format!("Failed to push '{}'", tag))?;
        }
        debug!(source = %existing.tag, tag, "Tagged cached image");
        Ok(())
    }

    async fn prune(&self, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = tags.iter().map(|t| format!("'{}'", t)).collect();
        let command = format!("docker rmi --force {}", quoted.join(" "));
        run_shell(&command, Path::new("."), &BTreeMap::new(), self.timeout).await?;
        info!(images = tags.len(), "Pruned images");
        Ok(())
    }
}

/// A test command bound to one image
#[derive(Debug, Clone)]
pub struct TestCommand {
    pub image: String,
    pub command: String,
}

/// Runs configured test commands against rebuilt images
pub struct CommandTester {
    tests: Vec<TestCommand>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandTester {
    pub fn new(tests: Vec<TestCommand>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            tests,
            workdir: workdir.into(),
            timeout: Duration::from_secs(600),
        }
    }
}

#[async_trait]
impl Tester for CommandTester {
    async fn test(&self, built: &[BuildResult]) -> std::result::Result<(), TestFailure> {
        let mut failed = Vec::new();
        let mut messages = Vec::new();

        for result in built {
            for test in self.tests.iter().filter(|t| t.image == result.image) {
                let env = BTreeMap::from([("IMAGE".to_string(), result.tag.clone())]);
                if let Err(e) = run_shell(&test.command, &self.workdir, &env, self.timeout).await {
                    messages.push(format!("{}: {:#}", result.image, e));
                    if !failed.contains(&result.image) {
                        failed.push(result.image.clone());
                    }
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TestFailure {
                failed,
                message: messages.join("; "),
            })
        }
    }
}

/// Deploy commands
#[derive(Debug, Clone, Default)]
pub struct DeployCommands {
    pub deploy: String,
    pub render: Option<String>,
    pub cleanup: Option<String>,
    pub status: Option<String>,
}

/// Deploys by running shell commands with the image set in the environment
pub struct CommandDeployer {
    commands: DeployCommands,
    namespace: Option<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandDeployer {
    pub fn new(commands: DeployCommands, namespace: Option<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            namespace,
            workdir: workdir.into(),
            timeout: Duration::from_secs(600),
        }
    }

    fn env(&self, artifacts: &[BuildResult], labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("IMAGES".to_string(), images_env(artifacts));
        env.insert(
            "LABELS".to_string(),
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(ns) = &self.namespace {
            env.insert("NAMESPACE".to_string(), ns.clone());
        }
        env
    }

    async fn run(&self, command: &str, env: &BTreeMap<String, String>) -> Result<ShellOutput> {
        run_shell(command, &self.workdir, env, self.timeout)
            .await
            .map_err(|e| {
                let message = format!("{:#}", e);
                if is_unreachable(&message) {
                    InfrastructureError(message).into()
                } else {
                    e
                }
            })
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    async fn deploy(&self, artifacts: &[BuildResult], labels: &BTreeMap<String, String>) -> Result<()> {
        if self.commands.deploy.trim().is_empty() {
            debug!(artifacts = artifacts.len(), "No deploy command configured");
            return Ok(());
        }
        let env = self.env(artifacts, labels);
        self.run(&self.commands.deploy, &env).await?;
        info!(artifacts = artifacts.len(), "Deploy command finished");
        Ok(())
    }

    async fn render(&self, artifacts: &[BuildResult], labels: &BTreeMap<String, String>) -> Result<String> {
        let command = self
            .commands
            .render
            .as_deref()
            .context("No render command configured")?;
        let env = self.env(artifacts, labels);
        Ok(self.run(command, &env).await?.stdout)
    }

    async fn cleanup(&self) -> Result<()> {
        let Some(command) = &self.commands.cleanup else {
            debug!("No cleanup command configured");
            return Ok(());
        };
        let env = self.env(&[], &BTreeMap::new());
        self.run(command, &env).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusChecker for CommandDeployer {
    async fn check(&self, deployed: &[BuildResult]) -> Result<()> {
        let Some(command) = &self.commands.status else {
            return Ok(());
        };
        let env = self.env(deployed, &BTreeMap::new());
        self.run(command, &env).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Artifact, InputHash};
    use tempfile::TempDir;

    #[test]
    fn test_parse_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let stdout = format!("Step 1/2\nwriting image {} done\n", digest);
        assert_eq!(parse_digest(&stdout), Some(digest.clone()));
        assert_eq!(parse_digest(&format!("app@{}", digest)), Some(digest));
        assert_eq!(parse_digest("sha256:short"), None);
    }

    #[tokio::test]
    async fn test_run_shell_failure_reports_stderr() {
        let temp = TempDir::new().unwrap();
        let err = run_shell("echo boom >&2; exit 3", temp.path(), &BTreeMap::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_run_shell_timeout() {
        let temp = TempDir::new().unwrap();
        let err = run_shell("sleep 5", temp.path(), &BTreeMap::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_builder_passes_image_env() {
        let temp = TempDir::new().unwrap();
        let artifact = Artifact::new("app", temp.path()).with_build_command("echo \"$IMAGE\" > built.txt");
        let request = BuildRequest {
            artifact,
            tag: "repo/app:abc".to_string(),
            input_hash: InputHash("abc".to_string()),
            dependencies: BTreeMap::new(),
        };

        let built = CommandBuilder::new(false, None).build(&request).await.unwrap();
        assert_eq!(built.tag, "repo/app:abc");
        assert!(!built.pushed);
        let written = std::fs::read_to_string(temp.path().join("built.txt")).unwrap();
        assert_eq!(written.trim(), "repo/app:abc");
    }

    #[tokio::test]
    async fn test_builder_tags_existing_image() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("tagged.txt");
        let builder = CommandBuilder::new(false, None)
            .with_tag_command(format!("echo \"$SOURCE $IMAGE\" > '{}'", out.display()));
        let digest = format!("sha256:{}", "b".repeat(64));
        let existing = BuildResult::new("app", "app:1", Some(digest.clone()), InputHash("h".to_string()));

        builder.tag(&existing, "app:2").await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), format!("app:1@{} app:2", digest));
    }

    #[tokio::test]
    async fn test_tester_names_failing_images() {
        let temp = TempDir::new().unwrap();
        let tester = CommandTester::new(
            vec![
                TestCommand {
                    image: "app".to_string(),
                    command: "true".to_string(),
                },
                TestCommand {
                    image: "web".to_string(),
                    command: "exit 1".to_string(),
                },
            ],
            temp.path(),
        );
        let built = vec![
            BuildResult::new("app", "app:1", None, InputHash("a".to_string())),
            BuildResult::new("web", "web:1", None, InputHash("w".to_string())),
        ];

        let failure = tester.test(&built).await.unwrap_err();
        assert_eq!(failure.failed, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_infrastructure_error() {
        let temp = TempDir::new().unwrap();
        let deployer = CommandDeployer::new(
            DeployCommands {
                deploy: "echo 'Unable to connect to the server' >&2; exit 1".to_string(),
                ..Default::default()
            },
            None,
            temp.path(),
        );

        let err = deployer.deploy(&[], &BTreeMap::new()).await.unwrap_err();
        assert!(err.downcast_ref::<InfrastructureError>().is_some());
    }
}
