//! Supervising the process the bridge launches.

use std::process::{Child, ExitStatus};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

use crate::io::bridge::{BridgeExit, BridgeHandle};

/// How supervision ended.
#[derive(Debug)]
pub enum ChildOutcome {
    /// The child exited on its own.
    Exited(ExitStatus),
    /// A bridge failed first; the child was killed.
    BridgeFailed {
        bridge: &'static str,
        exit: BridgeExit,
        status: ExitStatus,
    },
}

/// Wait for `child` to exit, checking the bridges every `poll`. A failed
/// bridge means the channel is broken, so the child is killed rather than
/// left hanging on a pipe nobody serves.
pub fn supervise(
    child: &mut Child,
    bridges: &mut [&mut BridgeHandle],
    poll: Duration,
) -> Result<ChildOutcome> {
    loop {
        if let Some(status) = child.wait_timeout(poll).context("wait for child")? {
            debug!(exit_code = ?status.code(), "child exited");
            return Ok(ChildOutcome::Exited(status));
        }
        for bridge in bridges.iter_mut() {
            if let Some(exit) = bridge.try_exit()
                && exit.is_failure()
            {
                let exit = exit.clone();
                let name = bridge.name();
                error!(bridge = name, %exit, "bridge failed, killing child");
                if let Err(err) = child.kill() {
                    warn!(err = %err, "kill child");
                }
                let status = child.wait().context("wait child after kill")?;
                return Ok(ChildOutcome::BridgeFailed {
                    bridge: name,
                    exit,
                    status,
                });
            }
        }
    }
}
