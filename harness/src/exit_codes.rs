//! Stable exit codes for harness CLI commands.

use crate::engine::FailureKind;
use crate::io::coordinator::WaitError;

/// Every run passed (or the command succeeded).
pub const OK: i32 = 0;
/// Invalid usage, configuration or environment.
pub const INVALID: i32 = 1;
/// An invariant was violated, an action aborted the run, or a replay diverged.
pub const INVARIANT: i32 = 2;
/// A wait ran out of budget, on our side or the driven system's.
pub const TIMEOUT: i32 = 3;
/// The channel or its framing broke.
pub const TRANSPORT: i32 = 4;

pub fn for_failure(kind: &FailureKind) -> i32 {
    match kind {
        FailureKind::Invariant { .. } | FailureKind::Aborted { .. } | FailureKind::Diverged { .. } => {
            INVARIANT
        }
        FailureKind::Wait { source, .. } => for_wait_error(source),
    }
}

pub fn for_wait_error(err: &WaitError) -> i32 {
    match err {
        WaitError::Timeout(_)
        | WaitError::VisualStabilityTimeout { .. }
        | WaitError::Delegated { .. } => TIMEOUT,
        WaitError::Transport(_) | WaitError::Protocol(_) => TRANSPORT,
    }
}
