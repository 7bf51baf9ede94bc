//! Hierarchical agent orchestration core.
//!
//! Agents form a tree under an immortal root. Each agent is a tokio task that
//! owns its state machine and talks to the model through a sidecar gated by a
//! process-wide semaphore. Completion is gated on commitments checked by an
//! out-of-process verifier. The layering follows:
//!
//! - **[`core`]**: Pure, deterministic logic (lifecycle table, classifier,
//!   budgets, naming, tree invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting ports (store, messenger, check runner, config,
//!   prompt templates). Isolated behind traits so tests swap them out.
//!
//! Runtime modules ([`agent`], [`sidecar`], [`verifier`], [`registry`],
//! [`spawner`], [`orchestrator`], [`events`]) coordinate the two.

pub mod agent;
pub mod core;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod sidecar;
pub mod spawner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verifier;
