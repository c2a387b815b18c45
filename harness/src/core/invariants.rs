//! Invariants checked after every action, plus the reusable predicate shapes
//! this class of harness needs: model/reality flag agreement, forbidden
//! sub-states inside a restricted mode, resource bounds and cross-field
//! consistency.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::snapshot::StateSnapshot;

type CheckFn<M> = Box<dyn Fn(&M, &StateSnapshot) -> Result<(), String>>;

/// A named predicate over the model and the latest trusted snapshot.
pub struct Invariant<M> {
    name: String,
    check: CheckFn<M>,
}

impl<M> Invariant<M> {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&M, &StateSnapshot) -> Result<(), String> + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, model: &M, snapshot: &StateSnapshot) -> Result<(), String> {
        (self.check)(model, snapshot)
    }
}

impl<M> fmt::Debug for Invariant<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invariant")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A failed invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

/// Evaluate every invariant. Returns all violations (empty if all hold).
pub fn check_invariants<M>(
    invariants: &[Invariant<M>],
    model: &M,
    snapshot: &StateSnapshot,
) -> Vec<Violation> {
    invariants
        .iter()
        .filter_map(|invariant| {
            invariant
                .check(model, snapshot)
                .err()
                .map(|message| Violation {
                    invariant: invariant.name.clone(),
                    message,
                })
        })
        .collect()
}

/// The model's belief about a flag must equal what the driven system reports.
pub fn flag_agreement<M, MF, SF>(
    name: &str,
    label: &'static str,
    model_flag: MF,
    snapshot_flag: SF,
) -> Invariant<M>
where
    MF: Fn(&M) -> bool + 'static,
    SF: Fn(&StateSnapshot) -> bool + 'static,
{
    Invariant::new(name, move |model, snapshot| {
        let expected = model_flag(model);
        let actual = snapshot_flag(snapshot);
        if expected == actual {
            Ok(())
        } else {
            Err(format!(
                "model says {label}={expected}, driven system says {label}={actual}"
            ))
        }
    })
}

/// While `restricted` holds, none of `screens` may be reported.
pub fn forbidden_screens<M, R>(name: &str, restricted: R, screens: Vec<String>) -> Invariant<M>
where
    R: Fn(&M) -> bool + 'static,
{
    Invariant::new(name, move |model, snapshot| {
        if !restricted(model) {
            return Ok(());
        }
        match snapshot.screen.as_deref() {
            Some(screen) if screens.iter().any(|s| s == screen) => {
                Err(format!("forbidden screen {screen} shown in restricted mode"))
            }
            _ => Ok(()),
        }
    })
}

/// Numeric payload field must never be negative. Absent fields pass.
pub fn non_negative<M>(name: &str, pointer: &'static str) -> Invariant<M> {
    Invariant::new(name, move |_, snapshot| match snapshot.int_field(pointer) {
        Some(value) if value < 0 => Err(format!("{pointer} is negative ({value})")),
        _ => Ok(()),
    })
}

/// Array payload field must hold at most `max` entries. Absent fields pass.
pub fn bounded_len<M>(name: &str, pointer: &'static str, max: usize) -> Invariant<M> {
    Invariant::new(name, move |_, snapshot| match snapshot.len_field(pointer) {
        Some(len) if len > max => Err(format!("{pointer} has {len} entries (max {max})")),
        _ => Ok(()),
    })
}

/// When `premise` holds, `conclusion` must hold too.
pub fn implies<M, P, C>(name: &str, premise: P, conclusion: C) -> Invariant<M>
where
    P: Fn(&M, &StateSnapshot) -> bool + 'static,
    C: Fn(&M, &StateSnapshot) -> Result<(), String> + 'static,
{
    Invariant::new(name, move |model, snapshot| {
        if premise(model, snapshot) {
            conclusion(model, snapshot)
        } else {
            Ok(())
        }
    })
}

/// Invariant over the model alone (counters, bookkeeping).
pub fn model_only<M, F>(name: &str, check: F) -> Invariant<M>
where
    F: Fn(&M) -> Result<(), String> + 'static,
{
    Invariant::new(name, move |model, _| check(model))
}
