//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (worker replies, test logs, payloads) and return deterministic outputs
//! suitable for tests.

pub mod classifier;
pub mod dependencies;
pub mod extract;
pub mod imports;
pub mod schema;
pub mod termination;
pub mod types;
pub mod usage;
