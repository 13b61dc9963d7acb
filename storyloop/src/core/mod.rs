//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! spec snapshots and return deterministic outputs suitable for tests.

pub mod append_only;
pub mod immutability;
pub mod invariants;
pub mod phase;
pub mod selector;
pub mod state_update;
pub mod types;
