//! Agent lifecycle state machine.
//!
//! The transition table is fixed. A rejected request leaves the state
//! untouched; every applied transition is appended to the history with its
//! timestamp so it can be persisted and replayed.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::types::{AgentState, TransitionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: AgentState,
    pub to: AgentState,
}

/// True if `from -> to` is in the transition table.
pub fn is_allowed(from: AgentState, to: AgentState) -> bool {
    use AgentState::{Done, FailedReaped, Idle, Verifying, WaitingForInput, Working};
    matches!(
        (from, to),
        (Idle, Working)
            | (Working, WaitingForInput)
            | (Working, Verifying)
            | (Working, FailedReaped)
            | (WaitingForInput, Working)
            | (WaitingForInput, FailedReaped)
            | (Verifying, Done)
            | (Verifying, Working)
    )
}

/// Current state plus the ordered transition history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: AgentState,
    history: Vec<TransitionRecord>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AgentState::Idle,
            history: Vec::new(),
        }
    }

    /// Rebuild from persisted state. The history is trusted as written.
    pub fn restore(state: AgentState, history: Vec<TransitionRecord>) -> Self {
        Self { state, history }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Apply `self.state -> to`, or reject it without side effects.
    pub fn transition(
        &mut self,
        to: AgentState,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<&TransitionRecord, InvalidTransition> {
        let from = self.state;
        if !is_allowed(from, to) {
            return Err(InvalidTransition { from, to });
        }
        self.state = to;
        self.history.push(TransitionRecord {
            from,
            to,
            at,
            reason,
        });
        Ok(&self.history[self.history.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = AgentState> {
        prop::sample::select(AgentState::ALL.to_vec())
    }

    #[test]
    fn full_happy_path_is_recorded() {
        let mut lifecycle = Lifecycle::new();
        let at = Utc::now();
        for to in [
            AgentState::Working,
            AgentState::Verifying,
            AgentState::Working,
            AgentState::Verifying,
            AgentState::Done,
        ] {
            lifecycle.transition(to, None, at).expect("allowed");
        }
        assert_eq!(lifecycle.state(), AgentState::Done);
        assert_eq!(lifecycle.history().len(), 5);
        assert_eq!(lifecycle.history()[0].from, AgentState::Idle);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [AgentState::Done, AgentState::FailedReaped] {
            for to in AgentState::ALL {
                assert!(!is_allowed(terminal, to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn idle_cannot_be_reaped_directly() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle
            .transition(AgentState::FailedReaped, None, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, AgentState::Idle);
        assert_eq!(lifecycle.state(), AgentState::Idle);
        assert!(lifecycle.history().is_empty());
    }

    proptest! {
        #[test]
        fn rejected_transitions_leave_state_unchanged(from in any_state(), to in any_state()) {
            let mut lifecycle = Lifecycle::restore(from, Vec::new());
            let result = lifecycle.transition(to, None, Utc::now());
            if is_allowed(from, to) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(lifecycle.state(), to);
                prop_assert_eq!(lifecycle.history().len(), 1);
            } else {
                prop_assert_eq!(result.unwrap_err(), InvalidTransition { from, to });
                prop_assert_eq!(lifecycle.state(), from);
                prop_assert!(lifecycle.history().is_empty());
            }
        }
    }
}
