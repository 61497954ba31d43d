//! Command-line interface for devloop.
//!
//! Provides commands for one-shot builds and deploys, rendering manifests
//! and the long-lived dev loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::adapters::{
    tagger_for, CommandBuilder, CommandDeployer, CommandTester, Deployer, GlobResolver,
    NoopStatusChecker, RegistryVerifier, StatusChecker, TracingTailer, UnsupportedSyncer,
};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    cancellation, ArtifactGraph, Backends, BuildCache, CancelToken, FileBackend, Intents,
    MemoryBackend, RunContext, RunOptions, Runner,
};
use crate::domain::{ArtifactOutcome, BuildOutput, BuildResult, CycleReport, InputHash, PhaseOutcome};
use crate::watch::{FileMonitor, NotifyMonitor};

/// devloop - Continuous build, test and deploy for container workspaces
#[derive(Parser, Debug)]
#[command(name = "devloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to devloop.yaml (discovered from the current directory if not set)
    #[arg(short, long, global = true, env = "DEVLOOP_CONFIG")]
    pub filename: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build artifacts (all when none are named)
    Build {
        /// Artifacts to build; their dependencies are built too
        artifacts: Vec<String>,

        /// Write the built image references to this file
        #[arg(long)]
        file_output: Option<PathBuf>,
    },

    /// Build, test and deploy once
    Run,

    /// Deploy, building first unless build artifacts are given
    Deploy {
        /// Deploy images from a previous `build --file-output`
        #[arg(long)]
        build_artifacts: Option<PathBuf>,
    },

    /// Deploy images from a previous build without building
    Apply {
        #[arg(long)]
        build_artifacts: PathBuf,
    },

    /// Print rendered manifests
    Render {
        /// Render images from a previous `build --file-output`
        #[arg(long)]
        build_artifacts: Option<PathBuf>,
    },

    /// Watch the workspace and rebuild, test and redeploy on change
    Dev {
        /// Act on file changes without a build intent (b + enter)
        #[arg(long)]
        auto_build: Option<bool>,

        /// Act on sync-eligible changes without a sync intent (s + enter)
        #[arg(long)]
        auto_sync: Option<bool>,

        /// Redeploy without a deploy intent (d + enter)
        #[arg(long)]
        auto_deploy: Option<bool>,

        /// Delete deployed resources and built images on exit
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        cleanup: bool,
    },

    /// Delete deployed resources
    Cleanup,

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::load(self.filename.as_deref())?;

        match self.command {
            Commands::Build {
                artifacts,
                file_output,
            } => build(&config, &artifacts, file_output.as_deref()).await,
            Commands::Run => run(&config).await,
            Commands::Deploy { build_artifacts } => deploy(&config, build_artifacts.as_deref()).await,
            Commands::Apply { build_artifacts } => apply(&config, &build_artifacts).await,
            Commands::Render { build_artifacts } => render(&config, build_artifacts.as_deref()).await,
            Commands::Dev {
                auto_build,
                auto_sync,
                auto_deploy,
                cleanup,
            } => {
                let mut options = config.run_options();
                if let Some(value) = auto_build {
                    options.auto_build = value;
                }
                if let Some(value) = auto_sync {
                    options.auto_sync = value;
                }
                if let Some(value) = auto_deploy {
                    options.auto_deploy = value;
                }
                dev(&config, options, cleanup).await
            }
            Commands::Cleanup => cleanup(&config).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Wire the configured backends into a runner
async fn create_runner(config: &ResolvedConfig, options: RunOptions) -> Result<Runner> {
    config.validate()?;

    let graph = ArtifactGraph::new(config.file.artifacts.clone(), Arc::new(GlobResolver))?;
    let cache = open_cache(config, &options).await?;

    let deployer = Arc::new(CommandDeployer::new(
        config.deploy_commands(),
        options.namespace.clone(),
        &config.root,
    ));
    let status: Arc<dyn StatusChecker> = if options.status_check {
        deployer.clone()
    } else {
        Arc::new(NoopStatusChecker)
    };

    let backends = Backends {
        builder: Arc::new(CommandBuilder::new(options.push, options.namespace.clone())),
        tester: Arc::new(CommandTester::new(config.test_commands(), &config.root)),
        deployer,
        syncer: Arc::new(UnsupportedSyncer),
        tagger: tagger_for(&options.tag_policy),
        status,
        tailer: Arc::new(TracingTailer),
    };

    let ctx = RunContext::new(options);
    info!(run_id = %ctx.run_id(), config = %config.config_file.display(), "Loaded project");
    Ok(Runner::new(ctx, graph, cache, backends))
}

/// Build cache backed by the cache file, falling back to memory
async fn open_cache(config: &ResolvedConfig, options: &RunOptions) -> Result<BuildCache> {
    let policy = options.cache.clone();
    let path = config
        .cache_file()
        .unwrap_or_else(|| config.home.join("cache.json"));

    let cache = match prepare_cache_dir(&path) {
        Ok(()) => match FileBackend::open(&path).await {
            Ok(backend) => BuildCache::new(Arc::new(backend), policy.clone()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cache file unavailable, using memory cache");
                BuildCache::new(Arc::new(MemoryBackend::new()), policy.clone())
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cache directory unavailable, using memory cache");
            BuildCache::new(Arc::new(MemoryBackend::new()), policy.clone())
        }
    };

    if policy.verify_remote {
        let verifier = RegistryVerifier::new()?
            .with_insecure_registries(config.file.build.insecure_registries.clone());
        let verifier = match std::env::var("DEVLOOP_REGISTRY_TOKEN") {
            Ok(token) => verifier.with_token(token),
            Err(_) => verifier,
        };
        return Ok(cache.with_verifier(Arc::new(verifier)));
    }
    Ok(cache)
}

fn prepare_cache_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Build artifacts and optionally record the results
async fn build(config: &ResolvedConfig, artifacts: &[String], file_output: Option<&Path>) -> Result<()> {
    let runner = create_runner(config, config.run_options()).await?;
    let built = runner.build(artifacts, &CancelToken::none()).await?;

    for result in &built {
        println!("{} -> {}", result.image, result.pinned_reference());
    }

    if let Some(path) = file_output {
        write_build_output(path, &built)?;
        eprintln!("\n[Wrote {} build(s) to {}]", built.len(), path.display());
    }
    Ok(())
}

/// Build, test and deploy once
async fn run(config: &ResolvedConfig) -> Result<()> {
    let runner = create_runner(config, config.run_options()).await?;
    let built = runner.build(&[], &CancelToken::none()).await?;
    runner.test(&built).await?;
    runner.deploy_and_log(&built).await?;
    eprintln!("\n[Deployed {} artifact(s)]", built.len());
    Ok(())
}

async fn deploy(config: &ResolvedConfig, build_artifacts: Option<&Path>) -> Result<()> {
    let runner = create_runner(config, config.run_options()).await?;
    let built = match build_artifacts {
        Some(path) => read_build_output(path)?,
        None => runner.build(&[], &CancelToken::none()).await?,
    };
    runner.deploy_and_log(&built).await?;
    eprintln!("\n[Deployed {} artifact(s)]", built.len());
    Ok(())
}

async fn apply(config: &ResolvedConfig, build_artifacts: &Path) -> Result<()> {
    let runner = create_runner(config, config.run_options()).await?;
    let built = read_build_output(build_artifacts)?;
    runner.apply(&built).await?;
    eprintln!("\n[Applied {} artifact(s)]", built.len());
    Ok(())
}

async fn render(config: &ResolvedConfig, build_artifacts: Option<&Path>) -> Result<()> {
    let runner = create_runner(config, config.run_options()).await?;
    let built = match build_artifacts {
        Some(path) => read_build_output(path)?,
        None => runner.build(&[], &CancelToken::none()).await?,
    };
    println!("{}", runner.render(&built).await?);
    Ok(())
}

/// Run the dev loop until interrupted
async fn dev(config: &ResolvedConfig, options: RunOptions, cleanup_on_exit: bool) -> Result<()> {
    let runner = create_runner(config, options).await?;

    let mut monitor = NotifyMonitor::new(config.file.dev.trigger_queue);
    for artifact in runner.graph().artifacts() {
        monitor.register(artifact.context.clone());
    }
    let events = monitor.start()?;

    let (handle, token) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping dev loop");
            handle.cancel();
        }
    });

    spawn_intent_reader(runner.intents());

    let mut reports = runner.subscribe();
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            print_report(&report);
        }
    });

    eprintln!("Watching for changes (b = build, s = sync, d = deploy, ctrl-c = stop)");
    let result = runner.dev(events, token).await;
    monitor.stop();

    if cleanup_on_exit {
        if let Err(e) = runner.cleanup().await {
            warn!(error = %e, "Cleanup failed");
        }
        if let Err(e) = runner.prune().await {
            warn!(error = %e, "Prune failed");
        }
    }

    result.map_err(Into::into)
}

/// Map stdin lines to intents: b(uild), s(ync), d(eploy)
fn spawn_intent_reader(intents: Arc<Intents>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match line.trim() {
                    "b" => intents.trigger_build(),
                    "s" => intents.trigger_sync(),
                    "d" => intents.trigger_deploy(),
                    "" => {}
                    other => eprintln!("Unknown command '{}' (b, s or d)", other),
                },
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin, intents disabled");
                    return;
                }
            }
        }
    });
}

/// Print a one-line-per-artifact summary of a cycle
fn print_report(report: &CycleReport) {
    if report.is_noop() {
        return;
    }

    println!("\n[Iteration {} ({:?})]", report.iteration, report.trigger);
    for (name, outcome) in &report.artifacts {
        let line = match outcome {
            ArtifactOutcome::Built { tag } => format!("built {}", tag),
            ArtifactOutcome::Cached { tag } => format!("cached {}", tag),
            ArtifactOutcome::Retagged { tag } => format!("retagged {}", tag),
            ArtifactOutcome::Synced { files } => format!("synced {} file(s)", files),
            ArtifactOutcome::Skipped { dependency } => format!("skipped ({} failed)", dependency),
            ArtifactOutcome::Failed { error } => format!("FAILED: {}", error),
        };
        println!("  {}: {}", name, line);
    }
    println!("  test: {}", phase_line(&report.test));
    println!("  deploy: {}", phase_line(&report.deploy));
    for error in &report.errors {
        println!("  error: {}", error);
    }
}

fn phase_line(outcome: &PhaseOutcome) -> String {
    match outcome {
        PhaseOutcome::NotRun => "-".to_string(),
        PhaseOutcome::Succeeded => "ok".to_string(),
        PhaseOutcome::Skipped { reason } => format!("skipped ({})", reason),
        PhaseOutcome::Failed { error } => format!("FAILED: {}", error),
    }
}

/// Delete deployed resources labelled for this project
async fn cleanup(config: &ResolvedConfig) -> Result<()> {
    let deployer = CommandDeployer::new(
        config.deploy_commands(),
        config.file.namespace.clone(),
        &config.root,
    );
    deployer.cleanup().await?;
    eprintln!("[Cleanup finished]");
    Ok(())
}

/// Show the resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    let options = config.run_options();

    println!("Config file: {}", config.config_file.display());
    println!("Project root: {}", config.root.display());
    println!("State dir: {}", config.home.display());
    println!(
        "Default repo: {}",
        options.default_repo.as_deref().unwrap_or("(none)")
    );
    println!(
        "Namespace: {}",
        options.namespace.as_deref().unwrap_or("(none)")
    );
    println!("Tag policy: {:?}", options.tag_policy);
    println!("Concurrency: {}", options.concurrency);
    println!(
        "Debounce: {}ms (max {}ms)",
        options.debounce.as_millis(),
        options.max_wait.as_millis()
    );
    println!("Test failure policy: {:?}", options.test_failure_policy);
    println!(
        "Cache: {} (remote verification: {})",
        if options.cache.enabled { "enabled" } else { "disabled" },
        options.cache.verify_remote
    );

    println!("\nArtifacts:");
    for artifact in &config.file.artifacts {
        let requires = if artifact.requires.is_empty() {
            String::new()
        } else {
            format!(" (requires {})", artifact.requires.join(", "))
        };
        println!("  {} @ {}{}", artifact.name, artifact.context.display(), requires);
    }

    match config.validate() {
        Ok(()) => println!("\nConfiguration is valid"),
        Err(e) => println!("\n{}", e),
    }
    Ok(())
}

fn write_build_output(path: &Path, built: &[BuildResult]) -> Result<()> {
    let outputs: Vec<BuildOutput> = built.iter().map(BuildOutput::from).collect();
    let json = serde_json::to_string_pretty(&outputs)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write build output: {}", path.display()))
}

/// Read a build output file back into results
fn read_build_output(path: &Path) -> Result<Vec<BuildResult>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read build output: {}", path.display()))?;
    let outputs: Vec<BuildOutput> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse build output: {}", path.display()))?;

    Ok(outputs.into_iter().map(result_from_output).collect())
}

fn result_from_output(output: BuildOutput) -> BuildResult {
    let (tag, digest) = match output.tag.split_once('@') {
        Some((tag, digest)) => (tag.to_string(), Some(digest.to_string())),
        None => (output.tag, None),
    };
    // Input hash is unknown for images built elsewhere
    BuildResult::new(output.image, tag, digest, InputHash(String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_output_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("builds.json");
        let digest = format!("sha256:{}", "b".repeat(64));
        let built = vec![
            BuildResult::new("app", "repo/app:v1", Some(digest.clone()), InputHash("h1".into())),
            BuildResult::new("base", "repo/base:v1", None, InputHash("h2".into())),
        ];

        write_build_output(&path, &built).unwrap();
        let read = read_build_output(&path).unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(read[0].tag, "repo/app:v1");
        assert_eq!(read[0].digest.as_deref(), Some(digest.as_str()));
        assert_eq!(read[1].pinned_reference(), "repo/base:v1");
    }

    #[test]
    fn test_dev_flags() {
        let cli = Cli::try_parse_from(["devloop", "dev", "--auto-build", "false", "--cleanup", "false"]).unwrap();
        match cli.command {
            Commands::Dev {
                auto_build,
                auto_sync,
                cleanup,
                ..
            } => {
                assert_eq!(auto_build, Some(false));
                assert_eq!(auto_sync, None);
                assert!(!cleanup);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
