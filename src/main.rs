use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use conductor::agent::{AgentExecutor, HttpClientFactory, ServiceGuard};
use conductor::config::Config;
use conductor::resilience::{CircuitBreaker, ConnectionPool, SweeperHandle};
use conductor::util::{blocking, write_atomic};
use conductor::workflow::{
    CheckpointStore, FileCheckpointStore, RunId, RunStatus, WorkflowEngine, WorkflowRun, WorkflowTemplate,
};
use conductor::{Error, Result};

/// Conductor - headless workflow runner for role-specialized agents
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1   Enable debug logging (alternative to --debug)\n    CONDUCTOR_API_KEY   Bearer token for the text-generation service")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a new run from a workflow template
    Run {
        /// Path to the workflow template (TOML)
        template: PathBuf,

        /// Template input as key=value; repeatable
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,

        /// Write produced artifacts under this directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Resume an interrupted run from its last checkpoint
    Resume {
        /// Run ID to resume
        run_id: String,

        /// Write produced artifacts under this directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// List runs that have a checkpoint
    List,

    /// Write the effective configuration to ~/.conductor/conductor.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_input(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()?));

    let (run, output_dir, sweeper) = match cli.command {
        Command::List => {
            for run_id in store.list().await? {
                println!("{}", run_id);
            }
            return Ok(());
        }
        Command::Init { force } => {
            let path = Config::config_path()?;
            if path.exists() && !force {
                return Err(Error::Validation(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            let path = config.save()?;
            println!("{}", path.display());
            return Ok(());
        }
        Command::Run {
            template,
            inputs,
            output_dir,
        } => {
            let template = read_template(template).await?;
            let inputs: BTreeMap<String, String> = inputs.into_iter().collect();
            let (engine, sweeper) = build_engine(&config, store);
            info!(template = %template.id, inputs = inputs.len(), "starting run");
            (engine.start(&template, inputs).await?, output_dir, sweeper)
        }
        Command::Resume { run_id, output_dir } => {
            let run_id: RunId = run_id
                .parse()
                .map_err(|e| Error::Validation(format!("invalid run id '{}': {}", run_id, e)))?;
            let (engine, sweeper) = build_engine(&config, store);
            (engine.resume(&run_id).await?, output_dir, sweeper)
        }
    };

    sweeper.shutdown();

    if let Some(dir) = output_dir {
        let snapshot = run.clone();
        blocking(move || write_artifacts(&snapshot, &dir)).await?;
    }
    println!("{}", serde_json::to_string_pretty(&run)?);

    match run.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => {
            eprintln!("run {} cancelled; resume with: conductor resume {}", run.id.short(), run.id);
            std::process::exit(130);
        }
        _ => {
            for err in &run.errors {
                error!(step = %err.step, kind = %err.kind, "{}", err.message);
            }
            std::process::exit(1);
        }
    }
}

/// Wire the resilience stack, the executor and the engine from `config`.
fn build_engine(config: &Config, store: Arc<FileCheckpointStore>) -> (WorkflowEngine, SweeperHandle) {
    let factory = HttpClientFactory::new(
        &config.service.model,
        config.service.api_key(),
        config.executor.call_timeout,
    );
    let pool = ConnectionPool::new(config.pool.clone(), Arc::new(factory));
    let sweeper = pool.spawn_sweeper(config.pool.sweep_interval);
    let guard = ServiceGuard {
        retry: config.retry.clone(),
        breaker: Arc::new(CircuitBreaker::new(
            config.service.endpoint.clone(),
            config.breaker.clone(),
        )),
        pool,
        endpoint: config.service.endpoint.clone(),
    };
    let executor = Arc::new(AgentExecutor::new(guard, config.executor.clone()));
    let engine = WorkflowEngine::new(config.engine.clone(), executor, store);

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    (engine, sweeper)
}

/// Load and validate a workflow template file off the async runtime.
async fn read_template(path: PathBuf) -> Result<WorkflowTemplate> {
    let text = blocking(move || Ok(std::fs::read_to_string(&path)?)).await?;
    WorkflowTemplate::from_toml(&text)
}

/// Write every artifact of `run` under `dir`. Artifact paths are already
/// relative and free of `..` segments.
fn write_artifacts(run: &WorkflowRun, dir: &Path) -> Result<()> {
    for artifact in run.artifacts() {
        let path = dir.join(&artifact.path);
        write_atomic(&path, artifact.content.as_bytes())?;
        info!(path = %path.display(), task_id = %artifact.producing_task_id, "artifact written");
    }
    Ok(())
}
