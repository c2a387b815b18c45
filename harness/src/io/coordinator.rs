//! Protocol coordinator: turns the inbound stream of JSON state lines into a
//! synchronous "send a command, wait until ready" interface.
//!
//! The coordinator is the single writer of the cached snapshots. Each parsed
//! line becomes a new `Arc<StateSnapshot>` that replaces the previous one
//! wholesale; readers keep whatever `Arc` they were handed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::core::command::Command;
use crate::core::protocol::{DelegatedCondition, HANDSHAKE_LINE, ProtocolError, decode_line};
use crate::core::snapshot::StateSnapshot;
use crate::io::transport::{Transport, TransportError};

/// Per-operation wait budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSettings {
    pub ready: Duration,
    /// Upper bound on a single poll inside a longer wait.
    pub poll_interval: Duration,
    pub state_update: Duration,
    pub visual_stable: Duration,
    pub session_change: Duration,
    pub first_ready: Duration,
    /// Substring of a delegated `visual_stable` error that means the driven
    /// system itself gave up waiting (matched case-insensitively).
    pub stability_marker: String,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            state_update: Duration::from_secs(5),
            visual_stable: Duration::from_secs(10),
            session_change: Duration::from_secs(60),
            first_ready: Duration::from_secs(60),
            stability_marker: "timed out".to_string(),
        }
    }
}

/// A wait ran out of budget on the harness side.
#[derive(Debug, Clone, Error)]
#[error("{operation} timed out after {}ms", .elapsed.as_millis())]
pub struct TimeoutError {
    pub operation: String,
    pub elapsed: Duration,
    pub last_snapshot: Arc<StateSnapshot>,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// The driven system reported that it never became visually stable.
    #[error("driven system reported visual stability timeout: {message}")]
    VisualStabilityTimeout {
        message: String,
        last_snapshot: Arc<StateSnapshot>,
    },
    /// Any other error reported by the driven system after a delegated wait.
    #[error("delegated wait `{condition}` failed: {message}")]
    Delegated {
        condition: DelegatedCondition,
        message: String,
        last_snapshot: Arc<StateSnapshot>,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol framing error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl WaitError {
    /// Timeouts (ours or the driven system's) may be retried by recovery
    /// routines; a broken channel or broken framing may not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::VisualStabilityTimeout { .. } | Self::Delegated { .. }
        )
    }

    pub fn last_snapshot(&self) -> Option<&Arc<StateSnapshot>> {
        match self {
            Self::Timeout(timeout) => Some(&timeout.last_snapshot),
            Self::VisualStabilityTimeout { last_snapshot, .. }
            | Self::Delegated { last_snapshot, .. } => Some(last_snapshot),
            Self::Transport(_) | Self::Protocol(_) => None,
        }
    }
}

pub struct Coordinator<T> {
    transport: T,
    settings: WaitSettings,
    latest: Arc<StateSnapshot>,
    trusted: Arc<StateSnapshot>,
    /// Cleared on every send, set by the next `ready_for_command=true` line.
    ready: bool,
    handshake_seen: bool,
    sent: Vec<String>,
}

impl<T: Transport> Coordinator<T> {
    pub fn connect(transport: T, settings: WaitSettings) -> Self {
        Self {
            transport,
            settings,
            latest: Arc::default(),
            trusted: Arc::default(),
            ready: false,
            handshake_seen: false,
            sent: Vec::new(),
        }
    }

    pub fn settings(&self) -> &WaitSettings {
        &self.settings
    }

    /// Most recent snapshot, including parse failures and error reports.
    pub fn latest(&self) -> Arc<StateSnapshot> {
        Arc::clone(&self.latest)
    }

    /// Most recent snapshot that carried no error.
    pub fn trusted(&self) -> Arc<StateSnapshot> {
        Arc::clone(&self.trusted)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Wire lines sent since the last call.
    pub fn take_sent(&mut self) -> Vec<String> {
        std::mem::take(&mut self.sent)
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Serialize and send one command. Readiness is cleared before the write.
    pub fn send_message(&mut self, command: &Command) -> Result<(), WaitError> {
        let line = command.to_line()?;
        self.ready = false;
        debug!(command = %line, "send");
        self.transport.send_line(&line)?;
        self.sent.push(line);
        Ok(())
    }

    /// Read at most one inbound line within `timeout`. `Ok(None)` when nothing
    /// arrived or the line carried no state (handshake, blank line).
    pub fn poll_one(&mut self, timeout: Duration) -> Result<Option<Arc<StateSnapshot>>, WaitError> {
        match self.transport.recv_line(timeout)? {
            Some(raw) => self.ingest(&raw),
            None => Ok(None),
        }
    }

    /// Consume whatever is already buffered, up to `max_messages`, without
    /// blocking. Returns how many lines were consumed.
    pub fn drain_pending(&mut self, max_messages: usize) -> Result<usize, WaitError> {
        let mut drained = 0;
        while drained < max_messages {
            match self.transport.try_recv_line()? {
                Some(raw) => {
                    self.ingest(&raw)?;
                    drained += 1;
                }
                None => break,
            }
        }
        if drained > 0 {
            debug!(drained, "drained pending lines");
        }
        Ok(drained)
    }

    fn ingest(&mut self, raw: &[u8]) -> Result<Option<Arc<StateSnapshot>>, WaitError> {
        let line = decode_line(raw)?;
        let text = line.trim();
        if text.is_empty() {
            return Ok(None);
        }
        if text == HANDSHAKE_LINE && !self.handshake_seen {
            self.handshake_seen = true;
            debug!("bridge handshake received");
            return Ok(None);
        }

        let snapshot = Arc::new(StateSnapshot::parse(text));
        match &snapshot.error {
            Some(error) => warn!(error = %error, "driven system reported an error"),
            None => self.trusted = Arc::clone(&snapshot),
        }
        if snapshot.ready_for_command {
            self.ready = true;
        }
        trace!(
            ready = snapshot.ready_for_command,
            in_session = snapshot.in_session,
            screen = snapshot.screen.as_deref().unwrap_or("-"),
            "state"
        );
        self.latest = Arc::clone(&snapshot);
        Ok(Some(snapshot))
    }

    /// Poll until `done` holds or the overall `timeout` elapses. The current
    /// state is checked first; each poll is bounded by what is left of the
    /// budget and by the poll interval.
    fn wait_until<F>(
        &mut self,
        operation: &str,
        timeout: Duration,
        done: F,
    ) -> Result<Arc<StateSnapshot>, WaitError>
    where
        F: Fn(&Self) -> bool,
    {
        let start = Instant::now();
        loop {
            if done(self) {
                return Ok(self.latest());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                debug!(operation, elapsed_ms = elapsed.as_millis() as u64, "wait timed out");
                return Err(TimeoutError {
                    operation: operation.to_string(),
                    elapsed,
                    last_snapshot: self.latest(),
                }
                .into());
            }
            let slice = (timeout - elapsed).min(self.settings.poll_interval);
            self.poll_one(slice)?;
        }
    }

    /// Block until a `ready_for_command=true` line has arrived since the last send.
    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn await_ready(&mut self, timeout: Duration) -> Result<Arc<StateSnapshot>, WaitError> {
        self.wait_until("await_ready", timeout, |c| c.ready)
    }

    /// Block until `predicate` holds for the latest snapshot (checked against
    /// the current one first).
    pub fn await_predicate<P>(
        &mut self,
        operation: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<Arc<StateSnapshot>, WaitError>
    where
        P: Fn(&StateSnapshot) -> bool,
    {
        self.wait_until(operation, timeout, |c| predicate(&c.latest))
    }

    pub fn await_in_session(&mut self, timeout: Duration) -> Result<Arc<StateSnapshot>, WaitError> {
        self.wait_until("await_in_session", timeout, |c| {
            c.ready && c.latest.in_session
        })
    }

    /// Ready and out of any session.
    pub fn await_main_menu(&mut self, timeout: Duration) -> Result<Arc<StateSnapshot>, WaitError> {
        self.wait_until("await_main_menu", timeout, |c| {
            c.ready && !c.latest.in_session && c.latest.is_trusted()
        })
    }

    pub fn await_screen(
        &mut self,
        screen: &str,
        timeout: Duration,
    ) -> Result<Arc<StateSnapshot>, WaitError> {
        let operation = format!("await_screen({screen})");
        self.wait_until(&operation, timeout, |c| c.ready && c.latest.screen_is(screen))
    }

    /// Ask for a fresh state record and wait for it.
    pub fn await_state_update(&mut self) -> Result<Arc<StateSnapshot>, WaitError> {
        self.send_message(&Command::new("state"))?;
        let timeout = self.settings.state_update;
        self.await_ready(timeout)
    }

    /// Delegated wait: the driven system blocks until `condition` holds, then
    /// reports readiness. An error on that report means the condition failed.
    #[instrument(skip(self, condition), fields(condition = %condition))]
    pub fn wait_for(
        &mut self,
        condition: &DelegatedCondition,
        timeout: Duration,
    ) -> Result<Arc<StateSnapshot>, WaitError> {
        self.send_message(&Command::wait_for(condition))?;
        let snapshot = self.await_ready(timeout)?;
        let Some(message) = snapshot.error.clone() else {
            return Ok(snapshot);
        };
        let marker = self.settings.stability_marker.to_lowercase();
        if *condition == DelegatedCondition::VisualStable
            && !marker.is_empty()
            && message.to_lowercase().contains(&marker)
        {
            return Err(WaitError::VisualStabilityTimeout {
                message,
                last_snapshot: snapshot,
            });
        }
        Err(WaitError::Delegated {
            condition: condition.clone(),
            message,
            last_snapshot: snapshot,
        })
    }

    pub fn await_visual_stable(&mut self) -> Result<Arc<StateSnapshot>, WaitError> {
        let timeout = self.settings.visual_stable;
        self.wait_for(&DelegatedCondition::VisualStable, timeout)
    }

    /// First readiness signal after the bridge handshake.
    pub fn await_first_ready(&mut self) -> Result<Arc<StateSnapshot>, WaitError> {
        let timeout = self.settings.first_ready;
        self.wait_until("await_first_ready", timeout, |c| c.ready)
    }
}
