//! Side-effecting adapters: configuration, processes, workers, tests, artifacts.

pub mod artifacts;
pub mod config;
pub mod process;
pub mod prompt;
pub mod test_runner;
pub mod transport;
