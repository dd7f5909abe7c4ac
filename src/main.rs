mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taxflow_core::config::AppConfig;
use taxflow_core::definition::WorkflowDefinition;
use taxflow_core::event::EventBus;
use taxflow_core::execution::{ExecutionSnapshot, ExecutionStatus, StageState};
use taxflow_core::ExecutionOptions;
use taxflow_engine::{ExecutionEngine, GraphValidator, RunLogger, TriggerScheduler};

use crate::simulate::{SimulatedActionExecutor, TracingNotifier};

#[derive(Parser)]
#[command(name = "taxflow", version, about = "Tax and accounting workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taxflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and report errors and warnings
    Validate {
        /// Definition file (.toml or .json)
        file: PathBuf,
    },
    /// Run a workflow definition against simulated actions
    Run {
        /// Definition file (.toml or .json)
        file: PathBuf,
        /// Overall deadline in seconds (overrides the definition)
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Maximum stages in flight at once
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Register definitions and fire their schedule triggers until Ctrl-C
    Daemon {
        /// Definition files (.toml or .json)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taxflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "taxflow", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { file } => validate(&config, &file),
        Commands::Run {
            file,
            deadline_secs,
            max_concurrency,
            json,
        } => {
            if let Some(n) = max_concurrency {
                config.engine.max_concurrent_stages = n;
            }
            run(&config, &file, deadline_secs, json).await
        }
        Commands::Daemon { files } => daemon(&config, &files).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let config = AppConfig::load(path)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

fn build_engine(config: &AppConfig, event_bus: Arc<EventBus>) -> ExecutionEngine {
    let simulation = config.simulation.clone().unwrap_or_default();
    ExecutionEngine::new(
        config,
        Arc::new(SimulatedActionExecutor::new(simulation)),
        Arc::new(TracingNotifier),
        event_bus,
    )
}

/// Start the JSONL run logger when `[log]` is enabled.
fn spawn_run_logger(
    config: &AppConfig,
    event_bus: &EventBus,
    cancel: &CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let log = config.log.as_ref().filter(|l| l.enabled)?;
    let logger = RunLogger::new(log.dir(), event_bus);
    Some(tokio::spawn(logger.run(cancel.clone())))
}

fn validate(config: &AppConfig, file: &Path) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(file)?;
    let report = GraphValidator::new(config.validation.clone()).validate(&definition);

    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    for error in &report.errors {
        println!("error: {}", error);
    }

    if !report.valid {
        anyhow::bail!(
            "{} is invalid ({} error(s))",
            file.display(),
            report.errors.len()
        );
    }
    println!(
        "{}: {} stage(s), {} warning(s)",
        definition.id,
        definition.stages.len(),
        report.warnings.len()
    );
    Ok(())
}

async fn run(
    config: &AppConfig,
    file: &Path,
    deadline_secs: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(file)?;
    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let cancel = CancellationToken::new();
    let logger = spawn_run_logger(config, &event_bus, &cancel);
    let engine = build_engine(config, event_bus);

    let mut options = ExecutionOptions::default();
    if let Some(secs) = deadline_secs {
        options = options.with_deadline(secs);
    }

    let handle = engine.start(definition, options)?;
    info!(execution_id = %handle.id(), "Execution started");

    // Ctrl-C cancels; in-flight stages still finish
    let control = handle.control();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution...");
            control.cancel().await.ok();
        }
    });

    let exec = handle.wait().await?;
    interrupt.abort();

    cancel.cancel();
    if let Some(logger) = logger {
        logger.await.ok();
    }

    let snapshot = ExecutionSnapshot::from(&exec);
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }

    if exec.status != ExecutionStatus::Completed {
        anyhow::bail!("execution {} ended {:?}", exec.id, exec.status);
    }
    Ok(())
}

fn print_snapshot(snapshot: &ExecutionSnapshot) {
    println!(
        "Execution {} ({}): {:?}",
        snapshot.execution_id, snapshot.workflow_id, snapshot.status
    );
    for stage in &snapshot.stage_states {
        let mut line = format!("  {:<24} {}", stage.stage_id, stage.state);
        if stage.retry_count > 0 {
            line.push_str(&format!("  retries={}", stage.retry_count));
        }
        if stage.state == StageState::Skipped {
            if let Some(reason) = stage.skip_reason {
                line.push_str(&format!("  ({})", reason));
            }
        }
        if let Some(error) = &stage.last_error {
            line.push_str(&format!("  last error: {}", error));
        }
        println!("{}", line);
    }

    let m = &snapshot.metrics;
    println!(
        "Documents: {} processed, {} succeeded, {} failed; {} external call(s)",
        m.documents_processed, m.documents_succeeded, m.documents_failed, m.external_calls
    );
    println!(
        "Stages: {} completed, {} failed, {} skipped; {} retr(ies)",
        m.stages_completed, m.stages_failed, m.stages_skipped, m.total_retries
    );
    for b in &snapshot.bottlenecks {
        println!(
            "Bottleneck: {} +{:.0}% ({:?}): {}",
            b.stage_id,
            b.delay_percentage,
            b.severity,
            b.root_causes.join("; ")
        );
    }
    println!(
        "SLA: {}  Score: {:.1}",
        snapshot.sla_status, m.performance_score
    );
}

async fn daemon(config: &AppConfig, files: &[PathBuf]) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let cancel = CancellationToken::new();
    let logger = spawn_run_logger(config, &event_bus, &cancel);
    let engine = build_engine(config, event_bus);

    let mut scheduler = TriggerScheduler::new(engine, cancel.clone());
    for file in files {
        let definition = WorkflowDefinition::load(file)?;
        info!(workflow_id = %definition.id, path = %file.display(), "Registering workflow");
        scheduler.register(definition)?;
    }

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down daemon...");
        cancel_clone.cancel();
    });

    scheduler.run().await;

    if let Some(logger) = logger {
        logger.await.ok();
    }
    Ok(())
}
