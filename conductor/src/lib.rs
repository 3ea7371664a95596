//! Orchestration of unreliable text-generating workers into a tested program.
//!
//! A run drives a fixed phase sequence (plan, optional data extraction, code
//! generation, review, test-driven improvement, documentation) where every
//! worker reply is extracted, validated against a schema and retried with a
//! corrective prompt until it fits. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (schemas, extraction, termination,
//!   failure classification). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, processes, worker transport,
//!   test runner, artifacts). Behind traits so tests can script them.
//!
//! Orchestration modules ([`phases`], [`invoker`], [`improve`], [`pipeline`])
//! combine the two to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod improve;
pub mod invoker;
pub mod io;
pub mod logging;
pub mod phases;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
