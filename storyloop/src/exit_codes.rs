//! Stable exit codes for storyloop CLI commands.

/// Command succeeded, the run reached Done, or `select` found an item.
pub const OK: i32 = 0;
/// Unexpected runtime failure (I/O, git, spawn).
pub const ERROR: i32 = 1;
/// Startup validation failed (config, spec format, dirty tree, wrong workdir).
pub const INVALID: i32 = 2;
/// The run halted: attempts exhausted or iteration limit reached.
pub const HALTED: i32 = 3;
/// The run halted on an integrity violation (spec, ledger, write scope, repository state).
pub const INTEGRITY: i32 = 4;
/// `storyloop select` found nothing left to do.
pub const COMPLETE: i32 = 5;
