//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (inbound lines, snapshots, model values) and return deterministic
//! outputs suitable for tests.

pub mod command;
pub mod invariants;
pub mod protocol;
pub mod selector;
pub mod settle;
pub mod snapshot;
pub mod trace;
