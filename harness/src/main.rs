//! Model-based harness for a driven interactive program.
//!
//! `bridge` is launched by the driven program and relays its stdio through
//! named pipes; `run` (usually the bridge's child) drives generated action
//! sequences and checks invariants; `replay` re-executes a recorded failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_harness::agent::{BridgeArgs, run_bridge};
use model_harness::arena::build_engine;
use model_harness::campaign::{CampaignOptions, CampaignStop, run_campaign};
use model_harness::exit_codes;
use model_harness::io::config::{DEFAULT_CONFIG_FILE, HarnessConfig, load_config};
use model_harness::io::coordinator::Coordinator;
use model_harness::io::fifo::PipePaths;
use model_harness::io::report::{FailureReport, load_failure_report, write_failure_report};
use model_harness::io::transport::LineTransport;
use model_harness::logging;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "model-harness",
    version,
    about = "Model-based stateful test harness for a line-protocol driven program"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay this process's stdio through named pipes and launch COMMAND.
    Bridge {
        /// Directory to create the temporary pipe directory in.
        #[arg(long)]
        pipe_dir: Option<PathBuf>,
        /// Program (and arguments) to launch with the pipe paths in its environment.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Connect through the pipes named in the environment and run generated sequences.
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Base seed (run `i` uses `seed + i`).
        #[arg(long)]
        seed: Option<u64>,
        /// Action budget per run.
        #[arg(long)]
        steps: Option<u32>,
        /// Number of runs.
        #[arg(long)]
        runs: Option<u32>,
    },
    /// Re-execute the action trace of a failure report against the live system.
    Replay {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Path to a `failure.json` written by `run`.
        #[arg(long)]
        trace: PathBuf,
    },
    /// Load and validate the configuration file.
    CheckConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Bridge { pipe_dir, command } => run_bridge(&BridgeArgs { pipe_dir, command }),
        Command::Run {
            config,
            seed,
            steps,
            runs,
        } => cmd_run(&config, seed, steps, runs),
        Command::Replay { config, trace } => cmd_replay(&config, &trace),
        Command::CheckConfig { config } => cmd_check_config(&config),
    }
}

fn cmd_check_config(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    println!(
        "config ok ({}): {} runs x {} steps, {} characters, {} encounters",
        path.display(),
        cfg.run.runs,
        cfg.run.steps,
        cfg.arena.characters.len(),
        cfg.arena.encounters.len()
    );
    Ok(exit_codes::OK)
}

/// Open the pipes and wait for the driven system's first readiness signal.
/// `Err(code)` carries the exit code for a connection failure.
fn connect(cfg: &HarnessConfig) -> Result<std::result::Result<Coordinator<LineTransport>, i32>> {
    let paths = PipePaths::from_env()?;
    let transport = match LineTransport::open_pipes(&paths) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("open pipes: {err}");
            return Ok(Err(exit_codes::TRANSPORT));
        }
    };
    let mut coord = Coordinator::connect(transport, cfg.wait_settings());
    if let Err(err) = coord.await_first_ready() {
        eprintln!("waiting for first readiness: {err}");
        return Ok(Err(exit_codes::for_wait_error(&err)));
    }
    Ok(Ok(coord))
}

fn cmd_run(path: &Path, seed: Option<u64>, steps: Option<u32>, runs: Option<u32>) -> Result<i32> {
    let mut cfg = load_config(path)?;
    if let Some(seed) = seed {
        cfg.run.seed = Some(seed);
    }
    if let Some(steps) = steps {
        cfg.run.steps = steps;
    }
    if let Some(runs) = runs {
        cfg.run.runs = runs;
    }
    cfg.validate().context("invalid command-line overrides")?;

    let mut coord = match connect(&cfg)? {
        Ok(coord) => coord,
        Err(code) => return Ok(code),
    };
    let seed = cfg.run.seed.unwrap_or_else(rand::random);
    info!(seed, "base seed");

    let mut engine = build_engine(Arc::new(cfg.arena.clone()), cfg.recovery_policy());
    let options = CampaignOptions {
        runs: cfg.run.runs,
        steps: cfg.run.steps,
        seed,
    };
    let outcome = run_campaign(&mut engine, &mut coord, &options, |run_index, report| {
        println!(
            "run {run_index}: passed ({} steps, {:?})",
            report.steps, report.stop
        );
    });

    match outcome.stop {
        CampaignStop::AllPassed => {
            println!("all {} runs passed (seed {seed})", outcome.runs_passed);
            Ok(exit_codes::OK)
        }
        CampaignStop::Failed { run_index, failure } => {
            let report = FailureReport::from_failure(seed, run_index, &failure);
            eprint!("{}", report.render());
            let paths = write_failure_report(Path::new(&cfg.artifacts.dir), &report)?;
            eprintln!("failure report: {}", paths.report_path.display());
            eprintln!(
                "replay with: model-harness replay --trace {}",
                paths.report_path.display()
            );
            Ok(exit_codes::for_failure(&failure.kind))
        }
    }
}

fn cmd_replay(config: &Path, trace: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let recorded = load_failure_report(trace)?;
    let script = recorded.trace.replay_steps();
    println!(
        "replaying {} actions from {} ({})",
        script.len(),
        recorded.run_id,
        recorded.kind
    );

    let mut coord = match connect(&cfg)? {
        Ok(coord) => coord,
        Err(code) => return Ok(code),
    };
    let mut engine = build_engine(Arc::new(cfg.arena.clone()), cfg.recovery_policy());

    match engine.replay(&mut coord, &script) {
        Ok(report) => {
            let diverged = recorded
                .trace
                .entries()
                .iter()
                .zip(report.trace.entries())
                .find(|(before, after)| before.model_after != after.model_after);
            if let Some((before, _)) = diverged {
                println!(
                    "replay diverged: model after step {} ({}) differs from the recording",
                    before.step, before.action
                );
                return Ok(exit_codes::INVARIANT);
            }
            println!(
                "replay completed {} actions without failure; the recorded {} failure did not reproduce",
                report.steps, recorded.kind
            );
            Ok(exit_codes::OK)
        }
        Err(failure) => {
            let report = FailureReport::from_failure(recorded.seed, recorded.run_index, &failure);
            eprint!("{}", report.render());
            let reproduced = report.kind == recorded.kind;
            println!(
                "replay failed [{}]; recorded failure {}",
                report.kind,
                if reproduced { "reproduced" } else { "differs" }
            );
            Ok(exit_codes::for_failure(&failure.kind))
        }
    }
}
