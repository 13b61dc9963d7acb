//! Iteration controller that drives a coding agent through a prioritized
//! work-item list, one item per iteration.
//!
//! Every iteration runs in a fresh agent process. Continuity lives only in
//! git history, the spec file and an append-only learnings ledger. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, mutation and
//!   integrity checks, state updates, the phase machine). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process
//!   execution). The agent and verification stages sit behind traits so tests
//!   can script them.
//!
//! Orchestration modules ([`start`], [`step`], [`looping`], [`select`],
//! [`validate`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod select;
pub mod spec;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
