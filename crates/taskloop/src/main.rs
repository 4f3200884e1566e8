//! taskloop - drive an agent until the work is verified complete.
//!
//! Main entry point for the CLI binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use eyre::{bail, WrapErr};
use taskloop::state::enqueue;
use taskloop::{claude_driver, FileStore, RunResult, RunStore};
use taskloop_core::workflow::PRESETS;
use taskloop_core::{Config, Workflow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "taskloop", about = "Bounded agent iteration loop", version)]
struct Cli {
    /// Workspace root (config, state, and relative paths resolve here)
    #[arg(long, global = true, default_value = ".", env = "TASKLOOP_WORKSPACE")]
    workspace: PathBuf,

    /// Config file path (layered over .taskloop/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run
    Run(RunArgs),

    /// Continue the run saved in the state directory
    Resume {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Manage the work queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Load and validate the configured workflow
    Validate {
        /// Built-in workflow preset (default, review, tdd)
        #[arg(long)]
        preset: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Append files to the queue of the active run
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Task text
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the task text from a file
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// Target files (plans, checklists); replaces `files` from config
    #[arg(long, num_args = 1..)]
    files: Vec<PathBuf>,

    /// Built-in workflow preset (default, review, tdd)
    #[arg(long)]
    preset: Option<String>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Flags layered over the loaded config.
#[derive(Args)]
struct Overrides {
    /// Maximum outer iterations
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Spend limit in USD
    #[arg(long)]
    max_budget: Option<f64>,

    /// Model passed to the agent CLI
    #[arg(long)]
    model: Option<String>,

    /// Do not append to report.tsv
    #[arg(long)]
    no_report: bool,
}

impl Overrides {
    fn apply(&self, config: &mut Config) -> eyre::Result<()> {
        if let Some(max_iterations) = self.max_iterations {
            config.max_iterations = max_iterations;
        }
        if let Some(max_budget) = self.max_budget {
            config.max_budget = max_budget;
        }
        if let Some(model) = &self.model {
            config.model.clone_from(model);
        }
        if self.no_report {
            config.report = false;
        }
        config.check()?;
        Ok(())
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
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

    let code = runtime.block_on(dispatch(cli))?;
    drop(runtime);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn dispatch(cli: Cli) -> eyre::Result<i32> {
    let workspace = cli.workspace;
    let explicit = cli.config.as_deref();

    match cli.command {
        Command::Run(args) => cmd_run(&workspace, explicit, args).await,
        Command::Resume { overrides } => cmd_resume(&workspace, explicit, &overrides).await,
        Command::Queue {
            command: QueueCommand::Add { paths },
        } => cmd_queue_add(&workspace, explicit, &paths),
        Command::Validate { preset } => cmd_validate(&workspace, explicit, preset),
    }
}

async fn cmd_run(workspace: &Path, explicit: Option<&Path>, args: RunArgs) -> eyre::Result<i32> {
    let mut config = Config::load(workspace, explicit)?;
    args.overrides.apply(&mut config)?;
    if !args.files.is_empty() {
        config.files = args.files;
        config.resolve_paths(workspace);
    }
    if let Some(preset) = args.preset {
        config.workflow = Workflow::from_preset(preset);
    }

    let task = match (args.prompt, args.prompt_file) {
        (Some(prompt), _) => prompt,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("failed to read prompt file {}", path.display()))?,
        (None, None) => bail!("one of --prompt or --prompt-file is required"),
    };

    // Reject malformed workflows before any state is written.
    let workflow = config.workflow.clone().resolve()?;

    let store = Arc::new(FileStore::create(
        &config.state_dir,
        task.as_str(),
        config.files.clone(),
        config.completion_promise.as_str(),
    )?);
    let prompt = store.rebuild_prompt()?;
    let driver = claude_driver(&config, workspace, store)?.with_task(task);

    info!(
        workflow = %workflow.name,
        model = %config.model,
        max_iterations = config.max_iterations,
        max_budget = config.max_budget,
        files = config.files.len(),
        "starting run"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let result = driver.run(&cancel, &workflow, &prompt, &config.files).await;
    Ok(report_outcome(result))
}

async fn cmd_resume(
    workspace: &Path,
    explicit: Option<&Path>,
    overrides: &Overrides,
) -> eyre::Result<i32> {
    let mut config = Config::load(workspace, explicit)?;
    overrides.apply(&mut config)?;
    let workflow = config.workflow.clone().resolve()?;

    let store = Arc::new(FileStore::open(&config.state_dir)?);
    let snapshot = store.snapshot();
    let prompt = store.rebuild_prompt()?;

    let mut driver = claude_driver(&config, workspace, store)?.with_task(snapshot.task);
    match snapshot.state {
        Some(state) => {
            info!(
                run_id = %state.run_id,
                iteration = state.iteration,
                total_cost = state.total_cost,
                "resuming run"
            );
            driver = driver.resume_from(state);
        }
        None => warn!("saved run has no iteration state; starting from the first iteration"),
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let result = driver.run(&cancel, &workflow, &prompt, &[]).await;
    Ok(report_outcome(result))
}

fn cmd_queue_add(workspace: &Path, explicit: Option<&Path>, paths: &[PathBuf]) -> eyre::Result<i32> {
    let config = Config::load(workspace, explicit)?;
    let paths: Vec<PathBuf> = paths
        .iter()
        .map(|p| if p.is_relative() { workspace.join(p) } else { p.clone() })
        .collect();
    let queued = enqueue(&config.state_dir, &paths)?;
    println!("queued {} file(s); {queued} pending", paths.len());
    Ok(0)
}

fn cmd_validate(
    workspace: &Path,
    explicit: Option<&Path>,
    preset: Option<String>,
) -> eyre::Result<i32> {
    let mut config = Config::load(workspace, explicit)?;
    if let Some(preset) = preset {
        config.workflow = Workflow::from_preset(preset);
    }

    let workflow = match config.workflow.clone().resolve() {
        Ok(workflow) => workflow,
        Err(err) => {
            eprintln!("invalid workflow: {err}");
            eprintln!("built-in presets: {}", PRESETS.join(", "));
            return Ok(1);
        }
    };

    let mode = if workflow.has_gates() { "gated" } else { "simple loop" };
    println!("workflow {} ({mode})", workflow.name);
    for (i, step) in workflow.steps.iter().enumerate() {
        let mut flags = Vec::new();
        if step.gate {
            flags.push("gate".to_string());
        }
        if let Some(target) = &step.on_fail {
            flags.push(format!("on_fail={target}"));
        }
        if step.deferred {
            flags.push("deferred".to_string());
        }
        println!("  {}. {} [{}]", i + 1, step.name, flags.join(", "));
    }
    if workflow.has_gates() {
        println!("max gate retries: {}", workflow.effective_max_gate_retries());
    }
    Ok(0)
}

/// Print the final outcome and map it to a process exit code.
fn report_outcome(result: RunResult) -> i32 {
    match result {
        Ok(state) => {
            println!(
                "completed after {} iteration(s): ${:.4} spent, {} tokens",
                state.iteration,
                state.total_cost,
                state.total_tokens()
            );
            0
        }
        Err(err) => {
            eprintln!("taskloop: {err}");
            err.exit_code()
        }
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut sigterm), Ok(mut sigint)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) else {
                warn!("failed to register signal handlers");
                return;
            };

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, cancelling run"),
                _ = sigterm.recv() => info!("received SIGTERM, cancelling run"),
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to register ctrl-c handler");
                return;
            }
            info!("received SIGINT, cancelling run");
        }

        cancel.cancel();
    });
}
