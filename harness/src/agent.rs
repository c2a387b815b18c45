//! `model-harness bridge`: the process the driven program launches.
//!
//! The driven program talks to this process over its stdio. Two bridges move
//! those lines through named pipes so the child (usually `model-harness run`)
//! can own the conversation.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::core::protocol::HANDSHAKE_LINE;
use crate::exit_codes;
use crate::io::bridge::{SharedWriter, start_input_bridge, start_output_bridge};
use crate::io::fifo::PipeDir;
use crate::io::process::{ChildOutcome, supervise};

const SUPERVISE_POLL: Duration = Duration::from_millis(200);
/// Time the output bridge gets to forward the child's last lines.
const OUTPUT_FLUSH_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BridgeArgs {
    /// Parent for the temporary pipe directory.
    pub pipe_dir: Option<PathBuf>,
    /// Program and arguments to launch once the bridges are up.
    pub command: Vec<String>,
}

/// Run the bridge until the child exits. Returns the process exit code.
pub fn run_bridge(args: &BridgeArgs) -> Result<i32> {
    let Some((program, program_args)) = args.command.split_first() else {
        bail!("bridge needs a command to run");
    };
    let pipes = PipeDir::create(args.pipe_dir.as_deref())?;
    let paths = pipes.paths().clone();
    let stdout = SharedWriter::new(io::stdout());

    let input_path = paths.input.clone();
    let mut input = start_input_bridge(
        || Ok(io::stdin()),
        move || OpenOptions::new().write(true).open(&input_path),
    )
    .context("start input bridge")?;

    let output_path = paths.output.clone();
    let sink = stdout.clone();
    let mut output = start_output_bridge(move || File::open(&output_path), move || Ok(sink))
        .context("start output bridge")?;

    // Both workers are up; only now may the driven program start sending.
    stdout
        .write_line(HANDSHAKE_LINE)
        .context("write handshake")?;
    info!(pipes = %pipes.path().display(), program = %program, "bridges started, launching child");

    let mut command = Command::new(program);
    command
        .args(program_args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(io::stderr()));
    for (name, value) in paths.env_pairs() {
        command.env(name, value);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("spawn {program}"))?;

    let outcome = supervise(&mut child, &mut [&mut input, &mut output], SUPERVISE_POLL)?;
    match outcome {
        ChildOutcome::Exited(status) => {
            if let Some(exit) = output.wait(OUTPUT_FLUSH_GRACE) {
                info!(%exit, "output bridge finished");
            }
            info!(exit_code = ?status.code(), "child finished");
            Ok(status.code().unwrap_or(exit_codes::INVALID))
        }
        ChildOutcome::BridgeFailed { bridge, exit, .. } => {
            warn!(bridge, %exit, "bridge failed");
            eprintln!("{bridge} failed: {exit}");
            Ok(exit_codes::TRANSPORT)
        }
    }
}
