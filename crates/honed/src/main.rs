//! honed - operator binary for the validation-refinement engine.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use eyre::WrapErr;
use hone_core::{Config, Id, Phase, Severity, WorkflowRun};
use honed::orchestrator::Orchestrator;
use honed::{default_db_path, Engine};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "honed", about = "Validation-refinement engine for generated IaC", version)]
struct Cli {
    /// Config file (key=value)
    #[arg(long, global = true, env = "HONED_CONFIG")]
    config: Option<PathBuf>,

    /// Checkpoint database path
    #[arg(long, global = true, env = "HONED_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run and wait for it to finish
    Run {
        /// File holding the requirements text
        requirements: PathBuf,

        /// Refine cycles allowed after the first validation
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Wall-clock budget for the whole run, in seconds
        #[arg(long)]
        timeout_sec: Option<u64>,

        /// Lowest severity that blocks (critical, high, medium, low, info)
        #[arg(long, value_parser = parse_severity)]
        blocking_severity: Option<Severity>,

        /// Validate this existing code before generating anything
        #[arg(long)]
        candidate: Option<PathBuf>,

        /// Print the run id as soon as the run is admitted
        #[arg(long)]
        detach: bool,
    },
    /// Resume every interrupted run and wait for them
    Resume,
    /// Print the status of a run
    Status { run_id: String },
    /// Cancel a stored run
    Cancel { run_id: String },
    /// List runs whose checkpoint retention has ended
    Expired,
}

fn parse_severity(value: &str) -> Result<Severity, String> {
    Severity::parse(value).ok_or_else(|| format!("unknown severity '{value}'"))
}

fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(db_path) = &cli.db_path {
        config.db_path = Some(db_path.clone());
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(run: &WorkflowRun) -> ExitCode {
    if run.phase == Phase::Done {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Wait for `work`, cancelling every active run on SIGINT/SIGTERM and then
/// waiting for them to checkpoint.
async fn until_signal<T>(
    orchestrator: &Orchestrator,
    work: impl Future<Output = eyre::Result<T>>,
) -> eyre::Result<T> {
    tokio::pin!(work);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

        tokio::select! {
            result = &mut work => return result,
            _ = sigint.recv() => info!("received SIGINT, cancelling active runs"),
            _ = sigterm.recv() => info!("received SIGTERM, cancelling active runs"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut work => return result,
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, cancelling active runs"),
        }
    }

    let cancelled = orchestrator.shutdown().await;
    info!(runs = cancelled.len(), "waiting for cancelled runs to checkpoint");
    work.await
}

async fn execute(cli: Cli) -> eyre::Result<ExitCode> {
    let config = load_config(&cli)?;
    let db_path = config.db_path.clone().unwrap_or_else(default_db_path);
    let engine = Engine::new(config, &db_path)
        .await
        .wrap_err("failed to initialize engine")?;
    let orchestrator = engine.orchestrator().clone();

    match cli.command {
        Command::Run {
            requirements,
            max_iterations,
            timeout_sec,
            blocking_severity,
            candidate,
            detach,
        } => {
            let text = std::fs::read_to_string(&requirements)
                .wrap_err_with(|| format!("failed to read {}", requirements.display()))?;
            let mut request = engine.config().run_request(text);
            if let Some(n) = max_iterations {
                request.max_iterations = n;
            }
            if let Some(secs) = timeout_sec {
                request.total_timeout_sec = secs;
            }
            if let Some(severity) = blocking_severity {
                request.blocking_severity = severity;
            }
            if let Some(path) = candidate {
                request.initial_candidate = Some(
                    std::fs::read_to_string(&path)
                        .wrap_err_with(|| format!("failed to read {}", path.display()))?,
                );
            }

            let run_id = orchestrator
                .start(request)
                .await
                .wrap_err("failed to start run")?;
            if detach {
                println!("{run_id}");
            }

            let run = until_signal(&orchestrator, async {
                orchestrator.wait(&run_id).await.wrap_err("failed to wait for run")
            })
            .await?;

            if detach {
                info!(
                    run_id = %run.run_id,
                    phase = run.phase.as_str(),
                    reason = run.terminal_reason.map_or("", |r| r.as_str()),
                    "run finished"
                );
            } else {
                print_json(&run)?;
            }
            Ok(exit_code(&run))
        }
        Command::Resume => {
            let resumed = orchestrator
                .resume_interrupted()
                .await
                .wrap_err("failed to resume runs")?;
            info!(runs = resumed.len(), "resumed interrupted runs");

            let runs = until_signal(&orchestrator, async {
                let mut finished = Vec::with_capacity(resumed.len());
                for run_id in &resumed {
                    finished.push(orchestrator.wait(run_id).await?);
                }
                Ok(finished)
            })
            .await?;

            for run in &runs {
                print_json(&run.status())?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { run_id } => {
            let status = orchestrator
                .get_status(&Id::from_string(run_id))
                .await
                .wrap_err("failed to read run status")?;
            print_json(&status)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel { run_id } => {
            let run_id = Id::from_string(run_id);
            orchestrator
                .cancel(&run_id)
                .await
                .wrap_err("failed to cancel run")?;
            print_json(&orchestrator.get_status(&run_id).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Expired => {
            let ids = orchestrator
                .store()
                .expired(Utc::now())
                .await
                .wrap_err("failed to list expired checkpoints")?;
            if ids.is_empty() {
                warn!("no expired checkpoints");
            }
            for id in ids {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> eyre::Result<ExitCode> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(execute(cli))
}
