//! Command-line interface for shipyard.
//!
//! Provides commands for running release pipelines, resuming interrupted
//! runs, inspecting run state, and validating definitions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::CancelHandle;
use crate::config;
use crate::core::{
    Engine, FanoutNotifier, JsonlNotifier, PipelineDefinition, RunFilter, RunResult, RunStore,
    TracingNotifier,
};
use crate::domain::{RunStatus, TriggerContext};

/// shipyard - Release pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "shipyard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline definition
    Run {
        /// Path to the pipeline definition (YAML)
        definition: PathBuf,

        /// Commit the release is built from
        #[arg(long, env = "SHIPYARD_COMMIT", default_value = "")]
        commit: String,

        /// Trigger parameter (repeatable)
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Maximum concurrently running stages
        #[arg(long)]
        concurrency: Option<usize>,

        /// Run timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Resume an interrupted run
    Resume {
        /// Run ID to resume
        run_id: String,

        /// Definition path (defaults to the one the run was started from)
        #[arg(short, long)]
        definition: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Only runs in this status
        #[arg(short, long)]
        status: Option<RunStatus>,

        /// Pipeline name glob
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Validate a pipeline definition without running it
    Validate {
        /// Path to the pipeline definition (YAML)
        definition: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                definition,
                commit,
                params,
                concurrency,
                timeout,
            } => run_pipeline(&definition, commit, params, concurrency, timeout).await,
            Commands::Resume { run_id, definition } => resume_run(&run_id, definition).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs {
                status,
                pipeline,
                limit,
            } => list_runs(status, pipeline, limit).await,
            Commands::Validate { definition } => validate_definition(&definition),
            Commands::Config => show_config(),
        }
    }
}

/// Engine wired from the resolved configuration
fn build_engine(concurrency: Option<usize>, timeout: Option<u64>) -> Result<Engine> {
    let cfg = config::config()?;

    let mut options = cfg.engine_options();
    if concurrency.is_some() {
        options.concurrency_limit = concurrency;
    }
    if let Some(secs) = timeout {
        options.run_timeout = Some(Duration::from_secs(secs));
    }

    let notifier = FanoutNotifier::new()
        .with(Arc::new(TracingNotifier))
        .with(Arc::new(JsonlNotifier::new(cfg.audit_path())));

    Ok(Engine::new(Arc::new(RunStore::new(cfg.runs_dir())), cfg.build_adapters()?)
        .with_options(options)
        .with_notifier(Arc::new(notifier))
        .with_redactor(cfg.redactor()))
}

/// Cancel handle fired by Ctrl-C
fn interrupt_handle() -> (CancelHandle, tokio::task::JoinHandle<()>) {
    let handle = CancelHandle::new();
    let watcher = tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                handle.cancel();
            }
        }
    });
    (handle, watcher)
}

/// Run a pipeline definition
async fn run_pipeline(
    definition_path: &Path,
    commit: String,
    params: Vec<(String, String)>,
    concurrency: Option<usize>,
    timeout: Option<u64>,
) -> Result<()> {
    let definition = PipelineDefinition::from_file(definition_path)?;
    let engine = build_engine(concurrency, timeout)?;

    let mut trigger = TriggerContext::new(commit, definition_path.display().to_string());
    for (key, value) in params {
        trigger = trigger.with_parameter(key, value);
    }

    let (handle, watcher) = interrupt_handle();
    let result = engine
        .run_with_cancel(&definition, trigger, handle.signal())
        .await;
    watcher.abort();

    report(&result?);
    Ok(())
}

/// Resume an interrupted run
async fn resume_run(run_id_str: &str, definition_path: Option<PathBuf>) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let engine = build_engine(None, None)?;

    let definition_path = match definition_path {
        Some(path) => path,
        None => {
            let run = engine.store().get(run_id).await?;
            if run.trigger.definition_ref.is_empty() {
                anyhow::bail!("Run {} has no recorded definition; pass --definition", run_id);
            }
            PathBuf::from(run.trigger.definition_ref)
        }
    };
    let definition = PipelineDefinition::from_file(&definition_path)?;

    let (handle, watcher) = interrupt_handle();
    let result = engine
        .resume_with_cancel(run_id, &definition, handle.signal())
        .await;
    watcher.abort();

    report(&result?);
    Ok(())
}

/// Print the outcome of a run; non-success exits with status 1
fn report(result: &RunResult) {
    match result.status {
        RunStatus::Succeeded => {
            for stage in &result.stages {
                if let Some(ref artifact) = stage.artifact {
                    println!("{}: {}", stage.stage, artifact);
                }
            }
            eprintln!("\n[Run {} succeeded]", result.run_id);
        }
        RunStatus::Failed | RunStatus::RolledBack => {
            eprintln!("\n[Run {} {}]", result.run_id, result.status);
            for (stage, error) in &result.failed {
                eprintln!("  {} failed: {}", stage, error);
            }
            for stage in &result.stages {
                if let Some(ref error) = stage.rollback_error {
                    eprintln!("  {} rollback failed: {}", stage.stage, error);
                }
            }
            eprintln!("  Rollback: {}", result.rollback);
            std::process::exit(1);
        }
        _ => {
            eprintln!("\n[Run {} in status: {}]", result.run_id, result.status);
        }
    }
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let store = RunStore::open_default()?;
    let run = store.get(run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("Definition: {}", run.definition_version);
    println!("Status: {}", run.status);
    println!("Created: {}", run.created_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if !run.trigger.commit.is_empty() {
        println!("Commit: {}", run.trigger.commit);
    }
    println!("Rollback: {}", run.rollback);
    println!("\nStages:");
    for exec in run.ordered_stages() {
        print!("  {:<20} {:<12} attempts={}", exec.stage, exec.status, exec.attempts);
        if let Some(ref artifact) = exec.artifact {
            print!(" artifact={}", artifact);
        }
        if let Some(ref reason) = exec.skip_reason {
            print!(" ({})", reason);
        }
        println!();
        if let Some(ref error) = exec.last_error {
            println!("  {:<20} last error: {}", "", error);
        }
        if let Some(ref error) = exec.rollback_error {
            println!("  {:<20} rollback error: {}", "", error);
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(status: Option<RunStatus>, pipeline: Option<String>, limit: usize) -> Result<()> {
    let store = RunStore::open_default()?;
    let filter = RunFilter {
        status,
        pipeline,
        limit: Some(limit),
    };
    let runs = store.list(&filter).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {:<25}", "RUN ID", "PIPELINE", "STATUS", "CREATED");
    println!("{}", "-".repeat(97));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<12} {:<25}",
            run.id,
            run.pipeline_name,
            run.status.to_string(),
            run.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

/// Validate a definition and print its execution order
fn validate_definition(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::from_file(path)?;

    println!("Pipeline: {}", definition.name());
    println!("Version: {}", definition.version());
    println!("\nExecution order:");
    for name in definition.graph().topological_order() {
        let depth = definition.graph().depth(name).unwrap_or_default();
        let deps: Vec<&str> = definition.graph().dependencies(name).collect();
        if deps.is_empty() {
            println!("  [{}] {}", depth, name);
        } else {
            println!("  [{}] {} <- {}", depth, name, deps.join(", "));
        }
    }

    let cfg = config::config()?;
    let missing = cfg.build_adapters()?.missing_for(&definition);
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
        warn!(missing = %names.join(", "), "Definition needs adapters that are not configured");
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Shipyard configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  Runs:  {}", cfg.runs_dir().display());
    println!("  Audit: {}", cfg.audit_path().display());
    println!();
    println!("Engine:");
    match cfg.engine.concurrency_limit {
        Some(limit) => println!("  Concurrency limit: {}", limit),
        None => println!("  Concurrency limit: unlimited"),
    }
    match cfg.engine.run_timeout_seconds {
        Some(secs) => println!("  Run timeout:       {}s", secs),
        None => println!("  Run timeout:       none"),
    }
    println!();
    println!("Adapters:");
    let bindings = [
        ("provisioner", &cfg.adapters.provisioner),
        ("builder", &cfg.adapters.builder),
        ("deployer", &cfg.adapters.deployer),
        ("configurator", &cfg.adapters.configurator),
    ];
    for (name, options) in bindings {
        match options {
            Some(options) => {
                println!("  {}: {}", name, options.command);
                if let Some(ref endpoint) = options.endpoint {
                    println!("    endpoint: {}", endpoint);
                }
                if options.credential_ref.is_some() {
                    println!("    credential: ***");
                }
            }
            None => println!("  {}: (not configured)", name),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("region=eu-west-1"),
            Ok(("region".to_string(), "eu-west-1".to_string()))
        );
        assert_eq!(
            parse_key_val("tags=a=b"),
            Ok(("tags".to_string(), "a=b".to_string()))
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "run",
            "release.yaml",
            "--commit",
            "abc123",
            "-p",
            "env=prod",
            "--param",
            "replicas=3",
            "--concurrency",
            "2",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                definition,
                commit,
                params,
                concurrency,
                timeout,
            } => {
                assert_eq!(definition, PathBuf::from("release.yaml"));
                assert_eq!(commit, "abc123");
                assert_eq!(params.len(), 2);
                assert_eq!(concurrency, Some(2));
                assert!(timeout.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_runs_status() {
        let cli = Cli::try_parse_from(["shipyard", "runs", "--status", "rolled-back"]).unwrap();
        match cli.command {
            Commands::Runs { status, limit, .. } => {
                assert_eq!(status, Some(RunStatus::RolledBack));
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
