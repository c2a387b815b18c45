//! Side-effecting parts of the harness: pipes, bridges, the protocol
//! coordinator, configuration and failure artifacts.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod fifo;
pub mod process;
pub mod report;
pub mod transport;
