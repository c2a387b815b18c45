//! Return-to-baseline recovery.
//!
//! Baseline means "out of any session, ready for a command". Reaching it may
//! take a few tries against a slow or transitioning driven system, so
//! recoverable wait failures are retried a bounded number of times with
//! doubling delays. Broken channels are never retried.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::command::Command;
use crate::core::protocol::DelegatedCondition;
use crate::core::snapshot::StateSnapshot;
use crate::io::coordinator::{Coordinator, TimeoutError, WaitError};
use crate::io::transport::Transport;

/// Backlog consumed before each attempt.
const DRAIN_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

/// Bring the driven system to the main menu. Returns the confirming snapshot.
pub fn ensure_baseline<T: Transport>(
    coord: &mut Coordinator<T>,
    policy: RecoveryPolicy,
) -> Result<Arc<StateSnapshot>, WaitError> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        match try_baseline(coord) {
            Ok(snapshot) => {
                if attempt > 1 {
                    info!(attempt, "baseline reached after retry");
                }
                return Ok(snapshot);
            }
            Err(err) if err.is_recoverable() && attempt < attempts => {
                warn!(attempt, attempts, delay_ms = delay.as_millis() as u64, err = %err, "baseline attempt failed, retrying");
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => {
                warn!(attempt, err = %err, "giving up on baseline");
                return Err(err);
            }
        }
    }
}

fn try_baseline<T: Transport>(coord: &mut Coordinator<T>) -> Result<Arc<StateSnapshot>, WaitError> {
    let started = Instant::now();
    coord.drain_pending(DRAIN_LIMIT)?;
    let snapshot = coord.await_state_update()?;
    if at_baseline(&snapshot) {
        debug!("already at baseline");
        return Ok(snapshot);
    }

    let settings = coord.settings().clone();
    coord.send_message(&Command::new("abandon"))?;
    let snapshot = coord.await_ready(settings.ready)?;
    if at_baseline(&snapshot) {
        return Ok(snapshot);
    }

    coord.wait_for(&DelegatedCondition::MainMenu, settings.session_change)?;
    let snapshot = coord.await_state_update()?;
    if at_baseline(&snapshot) {
        return Ok(snapshot);
    }
    Err(TimeoutError {
        operation: "ensure_baseline".to_string(),
        elapsed: started.elapsed(),
        last_snapshot: snapshot,
    }
    .into())
}

fn at_baseline(snapshot: &StateSnapshot) -> bool {
    snapshot.is_trusted() && !snapshot.in_session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::coordinator::WaitSettings;
    use crate::test_support::{FakeGame, Fault};

    fn fast() -> WaitSettings {
        WaitSettings {
            ready: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            state_update: Duration::from_millis(60),
            visual_stable: Duration::from_millis(60),
            session_change: Duration::from_millis(100),
            first_ready: Duration::from_millis(100),
            ..WaitSettings::default()
        }
    }

    fn policy(attempts: u32) -> RecoveryPolicy {
        RecoveryPolicy {
            attempts,
            initial_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn main_menu_needs_no_abandon() {
        let mut coord = Coordinator::connect(FakeGame::new(), fast());
        ensure_baseline(&mut coord, policy(1)).expect("baseline");
        assert_eq!(coord.transport_mut().received(), ["state"]);
    }

    #[test]
    fn abandons_an_open_session() {
        let mut coord = Coordinator::connect(FakeGame::in_session("DEFECT"), fast());
        let snapshot = ensure_baseline(&mut coord, policy(1)).expect("baseline");
        assert!(!snapshot.in_session);
        assert_eq!(coord.transport_mut().received(), ["state", "abandon"]);
    }

    #[test]
    fn recoverable_timeouts_are_retried() {
        let game = FakeGame::new().drop_next_replies(1);
        let mut coord = Coordinator::connect(game, fast());
        ensure_baseline(&mut coord, policy(3)).expect("baseline");
        assert_eq!(coord.transport_mut().received(), ["state", "state"]);
    }

    #[test]
    fn exhausted_attempts_are_fatal() {
        let game = FakeGame::in_session("WATCHER").with_fault(Fault::StuckInSession);
        let mut coord = Coordinator::connect(game, fast());
        let err = ensure_baseline(&mut coord, policy(2)).expect_err("stuck");
        assert!(err.is_recoverable(), "{err}");
        let abandons = coord
            .transport_mut()
            .received()
            .iter()
            .filter(|line| *line == "abandon")
            .count();
        assert_eq!(abandons, 2);
    }

    #[test]
    fn closed_channel_is_not_retried() {
        let mut game = FakeGame::new().with_fault(Fault::Silent);
        game.close();
        let mut coord = Coordinator::connect(game, fast());
        let err = ensure_baseline(&mut coord, policy(5)).expect_err("closed");
        assert!(matches!(err, WaitError::Transport(_)), "{err}");
    }
}
