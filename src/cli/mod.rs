//! TL-017: CLI subcommands - init, validate, graph, apply, status, forget, completions.

use crate::core::error::{Error, Result};
use crate::core::executor::Executor;
use crate::core::graph::is_valid_resource_id;
use crate::core::parser::{self, DeploymentConfig};
use crate::core::state::{FileStateStore, SqliteStateStore, StateStore};
use crate::core::types::{NodeOutcome, RunReport};
use crate::provider::SimulatedProvider;
use crate::resources::deployment;
use crate::tripwire::eventlog::EventLog;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File in the state directory holding the simulated remote world.
pub const SIMULATED_WORLD: &str = "remote.json";

/// SQLite database name inside the state directory.
pub const SQLITE_DB: &str = "state.db";

#[derive(Parser, Debug)]
#[command(
    name = "trustlink",
    version,
    about = "Secretless CI-to-cloud trust chains - dependency graph, deferred outputs, idempotent convergence"
)]
pub struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// State store backend.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// One YAML file per resource
    File,
    /// Single SQLite database
    Sqlite,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new trustlink project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate trustlink.yaml without contacting any platform
    Validate {
        /// Path to trustlink.yaml
        #[arg(short, long, default_value = "trustlink.yaml")]
        file: PathBuf,
    },

    /// Show execution waves of the deployment graph
    Graph {
        /// Path to trustlink.yaml
        #[arg(short, long, default_value = "trustlink.yaml")]
        file: PathBuf,
    },

    /// Converge the trust chain to the declared state
    Apply {
        /// Path to trustlink.yaml
        #[arg(short, long, default_value = "trustlink.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// State store backend
        #[arg(long, value_enum, default_value = "file")]
        backend: Backend,

        /// Read unchanged resources back before trusting state
        #[arg(long)]
        refresh: bool,
    },

    /// Show recorded state
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// State store backend
        #[arg(long, value_enum, default_value = "file")]
        backend: Backend,
    },

    /// Drop one resource's state record; the next apply recreates it
    Forget {
        /// Resource id
        resource: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// State store backend
        #[arg(long, value_enum, default_value = "file")]
        backend: Backend,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Graph { file } => cmd_graph(&file),
        Commands::Apply {
            file,
            state_dir,
            backend,
            refresh,
        } => cmd_apply(&file, &state_dir, backend, refresh),
        Commands::Status { state_dir, backend } => cmd_status(&state_dir, backend),
        Commands::Forget {
            resource,
            state_dir,
            backend,
        } => cmd_forget(&resource, &state_dir, backend),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "trustlink",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

const CONFIG_TEMPLATE: &str = r#"version: "1.0"
organization_url: https://dev.azure.com/my-organization/

project:
  name: azure-ready
  features:
    boards: disabled
    repositories: enabled
    pipelines: enabled
    testplans: disabled
    artifacts: disabled

pipeline:
  file: azure-pipelines.yaml
  source: azure-pipelines.yml
  branch: refs/heads/main
  commit_message: Add preconfigured pipeline file

identity:
  application_name: ADO Azure Ready App
  service_connection_name: azure-with-oidc
  credential_name: AzureReadyDeploys
  credential_description: Deployments for azure-ready-repository

cloud:
  tenant_id: 00000000-0000-0000-0000-000000000000
  subscription_id: 00000000-0000-0000-0000-000000000000
  subscription_name: My Subscription

policy:
  parallelism: 4
  max_retries: 3
  refresh: false
  tripwire: true
"#;

const PIPELINE_TEMPLATE: &str = r#"trigger:
  - main

pool:
  vmImage: ubuntu-latest

steps:
  - task: AzureCLI@2
    inputs:
      azureSubscription: azure-with-oidc
      scriptType: bash
      scriptLocation: inlineScript
      inlineScript: az account show
"#;

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join("trustlink.yaml");
    if config_path.exists() {
        return Err(Error::Config(format!(
            "{} already exists",
            config_path.display()
        )));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir)?;
    std::fs::write(&config_path, CONFIG_TEMPLATE)?;

    let pipeline_path = path.join("azure-pipelines.yml");
    if !pipeline_path.exists() {
        std::fs::write(&pipeline_path, PIPELINE_TEMPLATE)?;
    }

    println!("Initialized trustlink project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}", pipeline_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// Parse and validate a config file, printing every validation error.
fn parse_and_validate(file: &Path) -> Result<DeploymentConfig> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(Error::Config(format!(
        "{} validation error(s)",
        errors.len()
    )))
}

fn cmd_validate(file: &Path) -> Result<()> {
    let config = parse_and_validate(file)?;
    let deployment = deployment::declare(&config)?;
    let waves = deployment.graph.topological_order()?;
    println!(
        "OK: {} on {} ({} resources, {} waves)",
        config.project.name,
        config.organization_url,
        deployment.graph.len(),
        waves.len()
    );
    Ok(())
}

fn cmd_graph(file: &Path) -> Result<()> {
    let config = parse_and_validate(file)?;
    let deployment = deployment::declare(&config)?;
    let graph = &deployment.graph;
    let waves = graph.topological_order()?;

    println!("Deployment: {} ({} resources)", config.project.name, graph.len());
    for (index, wave) in waves.iter().enumerate() {
        println!();
        println!("Wave {}:", index + 1);
        for id in wave {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let mut line = format!("  {} ({})", id, node.spec.kind);
            if !node.depends_on.is_empty() {
                let deps: Vec<&str> = node.depends_on.iter().map(String::as_str).collect();
                line.push_str(&format!(" <- {}", deps.join(", ")));
            }
            let downstream = graph.dependents_of(id).len();
            if downstream > 0 {
                line.push_str(&format!("  [{} downstream]", downstream));
            }
            println!("{}", line);
        }
    }
    Ok(())
}

fn open_store(state_dir: &Path, backend: Backend) -> Result<Box<dyn StateStore>> {
    Ok(match backend {
        Backend::File => Box::new(FileStateStore::new(state_dir)),
        Backend::Sqlite => {
            std::fs::create_dir_all(state_dir)?;
            Box::new(SqliteStateStore::open(&state_dir.join(SQLITE_DB))?)
        }
    })
}

fn cmd_apply(file: &Path, state_dir: &Path, backend: Backend, refresh: bool) -> Result<()> {
    let mut config = parse_and_validate(file)?;
    config.policy.refresh |= refresh;
    let deployment = deployment::declare(&config)?;

    std::fs::create_dir_all(state_dir)?;
    let store = open_store(state_dir, backend)?;
    let provider = Arc::new(SimulatedProvider::persistent(
        &config.organization_name(),
        &state_dir.join(SIMULATED_WORLD),
    )?);

    let mut executor = Executor::new(provider, config.policy.clone());
    if config.policy.tripwire {
        executor = executor.with_event_log(EventLog::in_state_dir(state_dir));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(async {
        let token = executor.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted: finishing in-flight calls, starting nothing new.");
                token.cancel();
            }
        });
        let result = executor.run(&deployment.graph, store.as_ref()).await;
        interrupt.abort();
        result
    })?;

    print_report(&report);
    let outputs = report.into_outputs()?;
    for (name, value) in &outputs {
        println!("{} = {}", name, crate::core::cell::value_to_string(value));
    }
    Ok(())
}

/// Display a run report to stdout.
fn print_report(report: &RunReport) {
    println!("Run {}:", report.run_id);
    for node in report.nodes.values() {
        let symbol = match &node.outcome {
            NodeOutcome::Created => "+",
            NodeOutcome::Updated => "~",
            NodeOutcome::Replaced => "-/+",
            NodeOutcome::Unchanged => " ",
            NodeOutcome::Failed(_) => "!",
            NodeOutcome::Skipped { .. } | NodeOutcome::Cancelled => "?",
        };
        println!(
            "  {:>3} {} ({}): {} ({:.2}s)",
            symbol,
            node.resource_id,
            node.kind,
            node.outcome,
            node.duration.as_secs_f64()
        );
    }

    let changed = report.count(NodeOutcome::changed);
    let unchanged = report.count(|o| *o == NodeOutcome::Unchanged);
    let failed = report.count(|o| !o.is_converged());
    println!();
    if failed > 0 {
        println!(
            "Apply completed with errors: {} changed, {} unchanged, {} FAILED ({:.1}s)",
            changed,
            unchanged,
            failed,
            report.total_duration.as_secs_f64()
        );
    } else {
        println!(
            "Apply complete: {} changed, {} unchanged ({:.1}s).",
            changed,
            unchanged,
            report.total_duration.as_secs_f64()
        );
    }
}

fn cmd_status(state_dir: &Path, backend: Backend) -> Result<()> {
    if !state_dir.exists() {
        println!("No state found. Run `trustlink apply` first.");
        return Ok(());
    }
    let store = open_store(state_dir, backend)?;
    let records = store.list()?;
    if records.is_empty() {
        println!("No state found. Run `trustlink apply` first.");
        return Ok(());
    }

    println!("Resources: {}", records.len());
    for record in &records {
        let remote_id = record.remote_id().unwrap_or_else(|| "-".to_string());
        let applied = record.applied_at.as_deref().unwrap_or("unknown");
        println!(
            "  {}: {} [{}] id={} applied={}",
            record.resource_id, record.kind, record.inputs_hash, remote_id, applied
        );
    }
    Ok(())
}

fn cmd_forget(resource: &str, state_dir: &Path, backend: Backend) -> Result<()> {
    if !is_valid_resource_id(resource) {
        return Err(Error::Config(format!("invalid resource id '{}'", resource)));
    }
    let store = open_store(state_dir, backend)?;
    if !store.delete(resource)? {
        return Err(Error::Config(format!(
            "no state record for '{}'",
            resource
        )));
    }
    println!("Forgot {}; the next apply recreates it.", resource);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(dir: &Path) -> PathBuf {
        cmd_init(dir).unwrap();
        let file = dir.join("trustlink.yaml");
        let yaml = std::fs::read_to_string(&file)
            .unwrap()
            .replace("max_retries: 3", "max_retries: 3\n  min_backoff_ms: 1\n  max_backoff_ms: 2");
        std::fs::write(&file, yaml).unwrap();
        file
    }

    #[test]
    fn test_tl017_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("test-project");
        std::fs::create_dir_all(&sub).unwrap();
        cmd_init(&sub).unwrap();
        assert!(sub.join("trustlink.yaml").exists());
        assert!(sub.join("azure-pipelines.yml").exists());
        assert!(sub.join("state").is_dir());
    }

    #[test]
    fn test_tl017_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("trustlink.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_tl017_init_template_validates() {
        let dir = tempfile::tempdir().unwrap();
        let file = project(dir.path());
        cmd_validate(&file).unwrap();
        cmd_graph(&file).unwrap();
    }

    #[test]
    fn test_tl017_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("trustlink.yaml");
        std::fs::write(
            &file,
            r#"
version: "2.0"
organization_url: http://dev.azure.com/contoso
project:
  name: ready
cloud:
  tenant_id: t
  subscription_id: s
"#,
        )
        .unwrap();
        let err = cmd_validate(&file).unwrap_err();
        assert!(err.to_string().contains("3 validation error(s)"));
    }

    #[test]
    fn test_tl017_validate_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_validate(&dir.path().join("nope.yaml")).is_err());
    }

    #[test]
    fn test_tl017_apply_then_reapply() {
        let dir = tempfile::tempdir().unwrap();
        let file = project(dir.path());
        let state = dir.path().join("state");

        cmd_apply(&file, &state, Backend::File, false).unwrap();
        assert!(state.join(SIMULATED_WORLD).exists());
        assert!(state.join("events.jsonl").exists());
        let store = FileStateStore::new(&state);
        assert_eq!(store.list().unwrap().len(), 10);

        cmd_apply(&file, &state, Backend::File, true).unwrap();
        let log = std::fs::read_to_string(state.join("events.jsonl")).unwrap();
        assert_eq!(log.matches("run_completed").count(), 2);
        assert_eq!(log.matches("node_started").count(), 10);
    }

    #[test]
    fn test_tl017_apply_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        let file = project(dir.path());
        let state = dir.path().join("state");

        cmd_apply(&file, &state, Backend::Sqlite, false).unwrap();
        assert!(state.join(SQLITE_DB).exists());
        let store = SqliteStateStore::open(&state.join(SQLITE_DB)).unwrap();
        assert_eq!(store.list().unwrap().len(), 10);
        cmd_status(&state, Backend::Sqlite).unwrap();
    }

    #[test]
    fn test_tl017_apply_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("trustlink.yaml");
        std::fs::write(&file, "version: \"1.0\"\n").unwrap();
        assert!(cmd_apply(&file, &dir.path().join("state"), Backend::File, false).is_err());
        assert!(!dir.path().join("state").exists());
    }

    #[test]
    fn test_tl017_forget_then_apply_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let file = project(dir.path());
        let state = dir.path().join("state");
        cmd_apply(&file, &state, Backend::File, false).unwrap();

        cmd_forget("pipeline-authorization", &state, Backend::File).unwrap();
        let store = FileStateStore::new(&state);
        assert!(store.load("pipeline-authorization").unwrap().is_none());

        cmd_apply(&file, &state, Backend::File, false).unwrap();
        assert!(store.load("pipeline-authorization").unwrap().is_some());
        let log = std::fs::read_to_string(state.join("events.jsonl")).unwrap();
        assert_eq!(log.matches("node_started").count(), 11);
    }

    #[test]
    fn test_tl017_forget_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_forget("ghost", dir.path(), Backend::File).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_tl017_forget_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        std::fs::create_dir_all(state.join("resources")).unwrap();
        let outside = dir.path().join("x.state.yaml");
        std::fs::write(&outside, "keep").unwrap();

        let err = cmd_forget("../../x", &state, Backend::File).unwrap_err();
        assert!(err.to_string().contains("invalid resource id"));
        assert!(outside.exists());
    }

    #[test]
    fn test_tl017_status_empty() {
        let dir = tempfile::tempdir().unwrap();
        cmd_status(dir.path(), Backend::File).unwrap();
        cmd_status(&dir.path().join("missing"), Backend::File).unwrap();
    }

    #[test]
    fn test_tl017_cli_parses() {
        let cli = Cli::try_parse_from([
            "trustlink",
            "-v",
            "apply",
            "-f",
            "deploy.yaml",
            "--backend",
            "sqlite",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Apply {
                file,
                backend,
                refresh,
                ..
            } => {
                assert_eq!(file, PathBuf::from("deploy.yaml"));
                assert_eq!(backend, Backend::Sqlite);
                assert!(!refresh);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_tl017_dispatch_init_and_status() {
        let dir = tempfile::tempdir().unwrap();
        dispatch(Commands::Init {
            path: dir.path().to_path_buf(),
        })
        .unwrap();
        dispatch(Commands::Status {
            state_dir: dir.path().join("state"),
            backend: Backend::File,
        })
        .unwrap();
    }

    #[test]
    fn test_tl017_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
