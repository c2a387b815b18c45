//! Model-based test harness for a driven interactive program.
//!
//! The harness speaks a line-oriented command/state protocol with the driven
//! program, keeps its own model of what the program should be doing, and
//! checks invariants after every action. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (snapshot parsing, commands,
//!   traces, invariant predicates, action selection, settle rules). No I/O.
//! - **[`io`]**: Side-effecting operations (pipe bridges, transports, the
//!   protocol coordinator, config and report files).
//!
//! Orchestration modules ([`engine`], [`baseline`], [`arena`], [`campaign`],
//! [`agent`]) combine the two to implement the CLI commands.

pub mod agent;
pub mod arena;
pub mod baseline;
pub mod campaign;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
