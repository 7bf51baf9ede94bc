//! Deterministic, pure logic shared by the agent runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod commitment;
pub mod invariants;
pub mod lifecycle;
pub mod naming;
pub mod spin;
pub mod types;
