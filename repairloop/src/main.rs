use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use repairloop::core::phase::Phase;
use repairloop::exit_codes;
use repairloop::io::config::{
    DEFAULT_CONFIG_PATH, OrchestratorConfig, load_config, write_config,
};
use repairloop::io::generator::CommandGenerator;
use repairloop::io::harness::TestHarness;
use repairloop::io::run_log::RunLog;
use repairloop::io::tools::{CommandTool, ToolRegistry};
use repairloop::io::workspace::WorkspaceWriter;
use repairloop::logging;
use repairloop::looping::{LoopEvent, LoopStop, Orchestrator};
use repairloop::shutdown::Shutdown;
use repairloop::start::{StartOptions, start_or_resume};
use repairloop::status::{load_status, render_status};

const VERIFY_TOOL: &str = "verify";

#[derive(Parser)]
#[command(
    name = "repairloop",
    version,
    about = "Generate a project from a spec and repair it until its tests pass"
)]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct PathArgs {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Specification file handed to the generator.
    #[arg(long, global = true)]
    spec: Option<PathBuf>,
    /// Directory the generated project is written to.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// State document path (must be outside the workspace).
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    /// Directory for per-run JSON logs.
    #[arg(long, global = true)]
    logs: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run or resume the recorded one.
    Run(RunArgs),
    /// Print the recorded run state.
    Status {
        /// Include the tail of the last test output.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Write a config file with default values.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Retry budget for a fresh run (resumed runs keep their own).
    #[arg(long)]
    max_retries: Option<u32>,
    /// Generator backend name from the config.
    #[arg(long)]
    generator: Option<String>,
    /// Verification timeout in seconds.
    #[arg(long)]
    test_timeout: Option<u64>,
    /// Generator timeout in seconds.
    #[arg(long)]
    generator_timeout: Option<u64>,
    /// Ignore resumable state and start over.
    #[arg(long)]
    fresh: bool,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FATAL
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&cli.paths, &args),
        Command::Status { verbose } => cmd_status(&cli.paths, verbose),
        Command::Init { force } => cmd_init(&cli.paths, force),
    }
}

fn config_path(paths: &PathArgs) -> &Path {
    paths
        .config
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH))
}

/// Load the config file and layer command-line overrides on top.
fn resolve_config(paths: &PathArgs, run: Option<&RunArgs>) -> Result<OrchestratorConfig> {
    let mut config = load_config(config_path(paths))?;
    if let Some(spec) = &paths.spec {
        config.spec_path = spec.clone();
    }
    if let Some(workspace) = &paths.workspace {
        config.workspace_path = workspace.clone();
    }
    if let Some(state) = &paths.state {
        config.state_path = state.clone();
    }
    if let Some(logs) = &paths.logs {
        config.logs_path = logs.clone();
    }
    if let Some(run) = run {
        if let Some(max_retries) = run.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(generator) = &run.generator {
            config.generator.default = generator.clone();
        }
        if let Some(secs) = run.test_timeout {
            config.verify.timeout_secs = secs;
        }
        if let Some(secs) = run.generator_timeout
            && let Some(backend) = config.generator.backends.get_mut(&config.generator.default)
        {
            backend.timeout_secs = secs;
        }
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn cmd_run(paths: &PathArgs, args: &RunArgs) -> Result<i32> {
    let config = resolve_config(paths, Some(args))?;
    let generator_name = config.generator.default.clone();
    let backend = config.generator.backend(&generator_name)?;

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone())?;

    let started = start_or_resume(
        &config.spec_path,
        &config.workspace_path,
        &config.state_path,
        &StartOptions {
            max_retries: config.max_retries,
            fresh: args.fresh,
            clear_workspace: config.clear_workspace_on_fresh,
        },
    )?;
    let run_id = started.state.run_id.clone();
    if started.resumed {
        eprintln!(
            "resuming {run_id} at {} (attempt {}/{})",
            started.state.phase,
            started.state.attempt + 1,
            started.state.max_retries + 1
        );
    } else {
        eprintln!("starting {run_id}");
    }

    let harness = TestHarness::new(shutdown.clone())
        .with_env_policy(config.verify.env_policy())
        .with_output_limit(config.output_limit_bytes)
        .with_kill_grace(config.verify.kill_grace());
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CommandTool::new(
        VERIFY_TOOL,
        harness,
        config.verify.command.clone(),
        config.workspace_path.clone(),
        config.verify.timeout(),
    )))?;

    let generator = CommandGenerator::new(
        generator_name.clone(),
        backend.command.clone(),
        backend.timeout(),
        config.verify.kill_grace(),
        shutdown.clone(),
    );
    let run_log = RunLog::open(&config.logs_path, &run_id, &generator_name);

    let mut orchestrator = Orchestrator::new(
        started.store,
        generator,
        registry,
        WorkspaceWriter::new(config.workspace_path.clone()),
        started.spec,
        shutdown,
        config.output_limit_bytes,
    )
    .with_run_log(run_log);

    let outcome = orchestrator.run(print_progress)?;
    info!(run_id = %run_id, iterations = outcome.iterations, "loop finished");
    Ok(match outcome.stop {
        LoopStop::Success => {
            eprintln!(
                "success: tests passed on attempt {}/{}",
                outcome.state.attempt + 1,
                outcome.state.max_retries + 1
            );
            exit_codes::OK
        }
        LoopStop::Failed { reason } => {
            eprintln!("failed: {reason}");
            exit_codes::FAILED
        }
        LoopStop::Interrupted => {
            eprintln!(
                "interrupted at {}; rerun `repairloop run` to resume",
                outcome.state.phase
            );
            exit_codes::INTERRUPTED
        }
    })
}

fn print_progress(event: &LoopEvent) {
    match event {
        LoopEvent::Transition {
            to,
            attempt,
            max_retries,
            ..
        } => {
            let label = match to {
                Phase::Generating => "generating",
                Phase::Generated => "files applied",
                Phase::Testing => "testing",
                Phase::Patching => "patching",
                _ => return,
            };
            eprintln!("[attempt {}/{}] {label} ...", attempt + 1, max_retries + 1);
        }
        LoopEvent::Recovered { from, to } => {
            eprintln!("recovered interrupted {from}, continuing from {to}");
        }
        LoopEvent::Applied { written, rejected } => {
            if *rejected > 0 {
                eprintln!("  wrote {written} file(s), rejected {rejected}");
            } else {
                eprintln!("  wrote {written} file(s)");
            }
        }
        LoopEvent::Tested {
            passed,
            attempt,
            max_retries,
        } => {
            let verdict = if *passed { "passed" } else { "failed" };
            eprintln!("[attempt {}/{}] tests {verdict}", attempt + 1, max_retries + 1);
        }
    }
}

fn cmd_status(paths: &PathArgs, verbose: bool) -> Result<i32> {
    let config = resolve_config(paths, None)?;
    let report = load_status(&config.state_path, &config.spec_path)
        .with_context(|| format!("read {}", config.state_path.display()))?;
    print!("{}", render_status(&report, verbose)?);
    Ok(exit_codes::OK)
}

fn cmd_init(paths: &PathArgs, force: bool) -> Result<i32> {
    let path = config_path(paths);
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &OrchestratorConfig::default())?;
    eprintln!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

/// First SIGINT/SIGTERM requests a cooperative stop; a second one forces it,
/// so an in-flight process group is SIGKILLed without waiting out its grace.
/// The listener never exits the process itself: the loop returns once the
/// group is gone.
fn spawn_signal_listener(shutdown: Shutdown) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    std::thread::Builder::new()
        .name("repairloop-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(err) = wait_for_signals(&shutdown).await {
                    warn!(error = %err, "signal listener stopped");
                }
            });
        })
        .context("spawn signal listener")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signals(shutdown: &Shutdown) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
        if shutdown.is_requested() {
            eprintln!("second signal, killing running commands");
            shutdown.force();
        } else {
            eprintln!("stopping after the current step (signal again to force)");
            shutdown.request();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(shutdown: &Shutdown) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        warn!("Ctrl+C received");
        if shutdown.is_requested() {
            shutdown.force();
        } else {
            shutdown.request();
        }
    }
}
