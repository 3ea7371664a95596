//! Stable exit codes for conductor CLI commands.

/// Command succeeded; for `run`, the improvement loop converged.
pub const OK: i32 = 0;
/// Invalid config or input, unreachable worker, or another fatal error.
pub const INVALID: i32 = 1;
/// `conductor run` finished without the tests converging.
pub const NOT_CONVERGED: i32 = 2;
