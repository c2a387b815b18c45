//! Generalized model engine.
//!
//! One mutable model, a registry of guarded actions and a registry of
//! invariants. Each run brings the real system to a baseline, then repeatedly
//! picks an eligible action, executes it, advances the model from the
//! action's known effect and checks every invariant against the latest
//! trusted snapshot. Teardown always runs afterwards.

use std::fmt;
use std::sync::Arc;

use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::invariants::{Invariant, Violation, check_invariants};
use crate::core::selector::{SelectionStrategy, Uniform, run_rng};
use crate::core::snapshot::StateSnapshot;
use crate::core::trace::{ActionOutcome, ActionRecord, ActionTrace, ReplayStep};
use crate::io::coordinator::{Coordinator, WaitError};
use crate::io::transport::Transport;

/// Why an action, initialize or teardown could not finish.
#[derive(Debug, Error)]
pub enum StepError {
    /// A wait failed. Recovery routines may retry these when recoverable.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// The action saw something that must end the run. Never retried.
    #[error("{0}")]
    Aborted(String),
}

impl StepError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }
}

type Precondition<M> = Box<dyn Fn(&M) -> bool>;
type ArgGenerator<M> = Box<dyn Fn(&mut ChaCha8Rng, &M) -> Vec<String>>;
type Execute<M, T> = Box<dyn Fn(&M, &[String], &mut Coordinator<T>) -> Result<M, StepError>>;
type Initialize<M, T> = Box<dyn Fn(&mut Coordinator<T>) -> Result<M, StepError>>;
type Teardown<T> = Box<dyn Fn(&mut Coordinator<T>) -> Result<(), StepError>>;

struct Action<M, T> {
    name: String,
    precondition: Precondition<M>,
    args: ArgGenerator<M>,
    execute: Execute<M, T>,
}

/// Per-run knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub steps: u32,
    pub seed: u64,
    pub run_index: u64,
}

/// Why a run ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    BudgetExhausted,
    NoEligibleAction,
    ScriptCompleted,
}

#[derive(Debug, Clone)]
pub struct RunReport<M> {
    pub trace: ActionTrace,
    pub final_model: M,
    pub steps: u32,
    pub stop: RunStop,
}

#[derive(Debug, Error)]
pub enum FailureKind {
    #[error("invariant violated {}: {}", step_label(.step), join_violations(.violations))]
    Invariant {
        /// `None` for the check right after initialize.
        step: Option<u32>,
        violations: Vec<Violation>,
    },
    #[error("{phase}: {source}")]
    Wait { phase: String, source: WaitError },
    #[error("{phase} aborted: {reason}")]
    Aborted { phase: String, reason: String },
    #[error("replay diverged at step {step} ({action}): {reason}")]
    Diverged {
        step: u32,
        action: String,
        reason: String,
    },
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Invariant { .. } => "invariant",
            Self::Wait { source, .. } => match source {
                WaitError::Timeout(_) => "timeout",
                WaitError::VisualStabilityTimeout { .. } => "visual_stability_timeout",
                WaitError::Delegated { .. } => "delegated_wait",
                WaitError::Transport(_) => "transport",
                WaitError::Protocol(_) => "protocol",
            },
            Self::Aborted { .. } => "aborted",
            Self::Diverged { .. } => "diverged",
        }
    }

    fn from_step(phase: String, err: StepError) -> Self {
        match err {
            StepError::Wait(source) => Self::Wait { phase, source },
            StepError::Aborted(reason) => Self::Aborted { phase, reason },
        }
    }
}

fn step_label(step: &Option<u32>) -> String {
    match step {
        Some(step) => format!("after step {step}"),
        None => "at setup".to_string(),
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A failed run: what went wrong plus everything needed to reproduce it.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct RunFailure {
    pub kind: FailureKind,
    pub trace: ActionTrace,
    pub last_snapshot: Arc<StateSnapshot>,
    /// Model at the time of failure, when one existed.
    pub model: Option<Value>,
    /// Teardown failure observed after the primary failure.
    pub teardown_error: Option<String>,
}

enum Plan<'a> {
    Generate { rng: ChaCha8Rng, steps: u32 },
    Script(&'a [ReplayStep]),
}

impl Plan<'_> {
    fn len(&self) -> u32 {
        match self {
            Self::Generate { steps, .. } => *steps,
            Self::Script(steps) => u32::try_from(steps.len()).unwrap_or(u32::MAX),
        }
    }
}

struct Progress<M> {
    model: Option<M>,
    trace: ActionTrace,
    steps: u32,
}

/// Assemble a failure. Wait errors carry their own snapshot; everything
/// else uses the snapshot current when the failure happened.
fn failure<M: Serialize>(
    current: Arc<StateSnapshot>,
    kind: FailureKind,
    progress: Progress<M>,
    teardown_error: Option<String>,
) -> RunFailure {
    let last_snapshot = match &kind {
        FailureKind::Wait { source, .. } => source.last_snapshot().map_or(current, Arc::clone),
        _ => current,
    };
    RunFailure {
        model: progress
            .model
            .as_ref()
            .and_then(|model| serde_json::to_value(model).ok()),
        kind,
        trace: progress.trace,
        last_snapshot,
        teardown_error,
    }
}

pub struct Engine<M, T> {
    initialize: Initialize<M, T>,
    teardown: Teardown<T>,
    actions: Vec<Action<M, T>>,
    invariants: Vec<Invariant<M>>,
    strategy: Box<dyn SelectionStrategy>,
}

impl<M, T> Engine<M, T>
where
    M: Clone + Serialize,
    T: Transport,
{
    /// `initialize` brings the real system to a baseline and returns the
    /// starting model; `teardown` returns the system to baseline afterwards.
    pub fn new<I, D>(initialize: I, teardown: D) -> Self
    where
        I: Fn(&mut Coordinator<T>) -> Result<M, StepError> + 'static,
        D: Fn(&mut Coordinator<T>) -> Result<(), StepError> + 'static,
    {
        Self {
            initialize: Box::new(initialize),
            teardown: Box::new(teardown),
            actions: Vec::new(),
            invariants: Vec::new(),
            strategy: Box::new(Uniform),
        }
    }

    pub fn with_strategy(mut self, strategy: impl SelectionStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Register an action. It is eligible only while `precondition` holds;
    /// `execute` performs the side effect and returns the next model, derived
    /// from the old model and the action's known effect.
    pub fn register_action<P, A, E>(
        &mut self,
        name: &str,
        precondition: P,
        args: A,
        execute: E,
    ) -> &mut Self
    where
        P: Fn(&M) -> bool + 'static,
        A: Fn(&mut ChaCha8Rng, &M) -> Vec<String> + 'static,
        E: Fn(&M, &[String], &mut Coordinator<T>) -> Result<M, StepError> + 'static,
    {
        self.actions.push(Action {
            name: name.to_string(),
            precondition: Box::new(precondition),
            args: Box::new(args),
            execute: Box::new(execute),
        });
        self
    }

    pub fn register_invariant(&mut self, invariant: Invariant<M>) -> &mut Self {
        self.invariants.push(invariant);
        self
    }

    /// One generated run of at most `options.steps` actions.
    #[instrument(skip_all, fields(seed = options.seed, run = options.run_index))]
    pub fn run(
        &mut self,
        coord: &mut Coordinator<T>,
        options: &RunOptions,
    ) -> Result<RunReport<M>, RunFailure> {
        let plan = Plan::Generate {
            rng: run_rng(options.seed, options.run_index),
            steps: options.steps,
        };
        self.drive(coord, plan)
    }

    /// Re-execute a recorded trace, action by action, with the recorded arguments.
    #[instrument(skip_all, fields(steps = script.len()))]
    pub fn replay(
        &mut self,
        coord: &mut Coordinator<T>,
        script: &[ReplayStep],
    ) -> Result<RunReport<M>, RunFailure> {
        self.drive(coord, Plan::Script(script))
    }

    fn drive(&mut self, coord: &mut Coordinator<T>, plan: Plan<'_>) -> Result<RunReport<M>, RunFailure> {
        let mut progress = Progress {
            model: None,
            trace: ActionTrace::default(),
            steps: 0,
        };
        let outcome = self.execute_plan(coord, plan, &mut progress);
        let at_stop = coord.latest();
        let teardown = (self.teardown)(coord);

        match (outcome, teardown) {
            (Ok(stop), Ok(())) => {
                let Some(final_model) = progress.model else {
                    return Err(failure(
                        at_stop,
                        FailureKind::Aborted {
                            phase: "initialize".to_string(),
                            reason: "no model produced".to_string(),
                        },
                        progress,
                        None,
                    ));
                };
                info!(steps = progress.steps, ?stop, "run passed");
                Ok(RunReport {
                    trace: progress.trace,
                    final_model,
                    steps: progress.steps,
                    stop,
                })
            }
            (Ok(_), Err(err)) => {
                warn!(err = %err, "teardown failed after a passing run");
                let kind = FailureKind::from_step("teardown".to_string(), err);
                Err(failure(coord.latest(), kind, progress, None))
            }
            (Err(kind), teardown) => {
                let teardown_error = teardown.err().map(|err| {
                    warn!(err = %err, "teardown failed after run failure");
                    err.to_string()
                });
                warn!(failure = %kind, "run failed");
                Err(failure(at_stop, kind, progress, teardown_error))
            }
        }
    }

    fn execute_plan(
        &mut self,
        coord: &mut Coordinator<T>,
        mut plan: Plan<'_>,
        progress: &mut Progress<M>,
    ) -> Result<RunStop, FailureKind> {
        let model = (self.initialize)(coord)
            .map_err(|err| FailureKind::from_step("initialize".to_string(), err))?;
        coord.take_sent();
        self.check(&model, coord, None)?;
        progress.model = Some(model);

        for step in 1..=plan.len() {
            let Some(model) = progress.model.as_ref() else {
                break;
            };
            let (index, args) = match &mut plan {
                Plan::Generate { rng, .. } => match self.choose(rng, model) {
                    Some(choice) => choice,
                    None => {
                        debug!(step, "no eligible action");
                        return Ok(RunStop::NoEligibleAction);
                    }
                },
                Plan::Script(script) => {
                    let index = usize::try_from(step - 1).unwrap_or(usize::MAX);
                    match script.get(index) {
                        Some(recorded) => self.resolve(recorded, model, step)?,
                        None => break,
                    }
                }
            };

            let action = &self.actions[index];
            coord.take_sent();
            info!(step, action = %action.name, args = ?args, "executing action");
            let result = (action.execute)(model, &args, coord);
            let commands = coord.take_sent();
            progress.steps = step;

            match result {
                Ok(next) => {
                    progress.trace.push(ActionRecord {
                        step,
                        action: action.name.clone(),
                        args,
                        commands,
                        outcome: ActionOutcome::Completed,
                        model_after: serde_json::to_value(&next).ok(),
                    });
                    // Recorded before checking so a failure reports the model it judged.
                    let next = progress.model.insert(next);
                    self.check(next, coord, Some(step))?;
                }
                Err(err) => {
                    progress.trace.push(ActionRecord {
                        step,
                        action: action.name.clone(),
                        args,
                        commands,
                        outcome: ActionOutcome::Failed {
                            reason: err.to_string(),
                        },
                        model_after: None,
                    });
                    let phase = format!("step {step} ({})", action.name);
                    return Err(FailureKind::from_step(phase, err));
                }
            }
        }

        Ok(match plan {
            Plan::Generate { .. } => RunStop::BudgetExhausted,
            Plan::Script(_) => RunStop::ScriptCompleted,
        })
    }

    fn choose(&mut self, rng: &mut ChaCha8Rng, model: &M) -> Option<(usize, Vec<String>)> {
        let eligible: Vec<usize> = self
            .actions
            .iter()
            .enumerate()
            .filter(|(_, action)| (action.precondition)(model))
            .map(|(index, _)| index)
            .collect();
        let names: Vec<&str> = eligible
            .iter()
            .map(|&index| self.actions[index].name.as_str())
            .collect();
        let pick = self.strategy.select(rng, &names)?;
        let index = *eligible.get(pick)?;
        let args = (self.actions[index].args)(rng, model);
        Some((index, args))
    }

    fn resolve(
        &self,
        recorded: &ReplayStep,
        model: &M,
        step: u32,
    ) -> Result<(usize, Vec<String>), FailureKind> {
        let diverged = |reason: &str| FailureKind::Diverged {
            step,
            action: recorded.action.clone(),
            reason: reason.to_string(),
        };
        let index = self
            .actions
            .iter()
            .position(|action| action.name == recorded.action)
            .ok_or_else(|| diverged("unknown action"))?;
        if !(self.actions[index].precondition)(model) {
            return Err(diverged("precondition does not hold"));
        }
        Ok((index, recorded.args.clone()))
    }

    fn check(&self, model: &M, coord: &Coordinator<T>, step: Option<u32>) -> Result<(), FailureKind> {
        let snapshot = coord.trusted();
        let violations = check_invariants(&self.invariants, model, &snapshot);
        if violations.is_empty() {
            return Ok(());
        }
        for violation in &violations {
            warn!(invariant = %violation.invariant, message = %violation.message, "invariant violated");
        }
        Err(FailureKind::Invariant { step, violations })
    }
}

impl<M, T> fmt::Debug for Engine<M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field(
                "actions",
                &self.actions.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            )
            .field("invariants", &self.invariants)
            .finish_non_exhaustive()
    }
}
