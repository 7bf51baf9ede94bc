//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between the state machine, the
//! runtime actors, and the persisted documents. They carry no I/O and must
//! serialize identically across runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-unique agent identifier. Never reused for a different agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(raw.trim()).map(Self)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Closed set of agent variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// The always-alive coordinator. Has no parent and is never reaped.
    Root,
    /// Task-scoped worker whose life ends at completion or failure.
    Mortal,
}

impl AgentKind {
    pub fn is_immortal(self) -> bool {
        matches!(self, AgentKind::Root)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Root => "root",
            AgentKind::Mortal => "mortal",
        }
    }
}

/// Lifecycle state of a single agent. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentState {
    Idle,
    Working,
    WaitingForInput,
    Verifying,
    Done,
    FailedReaped,
}

impl AgentState {
    pub const ALL: [AgentState; 6] = [
        AgentState::Idle,
        AgentState::Working,
        AgentState::WaitingForInput,
        AgentState::Verifying,
        AgentState::Done,
        AgentState::FailedReaped,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Done | AgentState::FailedReaped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::WaitingForInput => "waitingForInput",
            AgentState::Verifying => "verifying",
            AgentState::Done => "done",
            AgentState::FailedReaped => "failedReaped",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal extracted from a messenger response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Done,
    Waiting,
}

/// What an agent does once it reaches `Done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DoneBehavior {
    /// Leave the tree immediately.
    #[default]
    Terminate,
    /// Stay registered in `Done` until dismissed.
    WaitIdle,
    /// Drain queued input before accepting completion, then terminate.
    CheckQueue,
}

/// Trigger that moved an agent into `FailedReaped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReapReason {
    TokenBudgetExceeded,
    SpinDetected,
    InputTimeout,
    ExternalReap,
    MessengerFailure,
    ParentReaped,
}

impl ReapReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReapReason::TokenBudgetExceeded => "tokenBudgetExceeded",
            ReapReason::SpinDetected => "spinDetected",
            ReapReason::InputTimeout => "inputTimeout",
            ReapReason::ExternalReap => "externalReap",
            ReapReason::MessengerFailure => "messengerFailure",
            ReapReason::ParentReaped => "parentReaped",
        }
    }
}

impl fmt::Display for ReapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub to: AgentState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
