//! Side-effecting adapters: filesystem, git and child processes.

pub mod agent;
pub mod config;
pub mod fs_atomic;
pub mod git;
pub mod harness;
pub mod init;
pub mod iteration_log;
pub mod ledger;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod spec_store;
pub mod verify;
