//! Supervisor tree construction.
//!
//! A spawn either fully succeeds or leaves no live agent behind. The name is
//! held by a registry reservation until the initial documents are written.
//! A child whose parent leaves the tree before recording it is reaped with
//! `parentReaped`.

use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::agent::{AgentContext, AgentHandle, AgentInit, launch};
use crate::core::commitment::{Commitment, CommitmentList};
use crate::core::lifecycle::Lifecycle;
use crate::core::naming::NameGenerator;
use crate::core::types::{AgentId, AgentKind, AgentState, DoneBehavior, ReapReason};
use crate::events::Notification;
use crate::io::config::HiveConfig;
use crate::io::records::{AgentRecord, write_agent, write_commitments};
use crate::io::store::StoreError;
use crate::registry::{Reservation, ReserveError};

const MAX_NAME_LEN: usize = 64;
const NAME_ATTEMPTS: usize = 64;

/// Options for a new agent. Omitted options take the defaults shown by
/// `SpawnConfig::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Required for parent-initiated spawns; absent for user-initiated ones.
    pub assignment: Option<String>,
    /// Falls back to `lifecycle.default_token_budget`.
    pub token_budget: Option<u64>,
    /// Generated from the name tiers if absent.
    pub name: Option<String>,
    pub initial_commitments: Vec<Commitment>,
    pub done_behavior: DoneBehavior,
}

impl SpawnConfig {
    pub fn assigned(assignment: impl Into<String>) -> Self {
        Self {
            assignment: Some(assignment.into()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.initial_commitments.push(commitment);
        self
    }

    pub fn with_token_budget(mut self, budget: u64) -> Self {
        self.token_budget = Some(budget);
        self
    }

    pub fn with_done_behavior(mut self, behavior: DoneBehavior) -> Self {
        self.done_behavior = behavior;
        self
    }
}

/// Who asked for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// An agent delegating work: the child starts `Working` on its assignment.
    Parent(AgentId),
    /// The user: the child attaches under the root and starts `Idle`.
    User,
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("name '{0}' is already taken")]
    NameTaken(String),
    #[error("invalid agent name '{0}'")]
    InvalidName(String),
    #[error("a parent-initiated spawn requires an assignment")]
    MissingAssignment,
    #[error("parent {0} not found")]
    ParentNotFound(AgentId),
    #[error("no root agent is running")]
    NoRoot,
    #[error("parent {id} is {state} and cannot take children")]
    ParentTerminal { id: AgentId, state: AgentState },
    #[error("agent capacity {0} reached")]
    CapacityExceeded(usize),
    #[error("persist initial agent document: {0}")]
    Persistence(#[from] StoreError),
}

impl From<ReserveError> for SpawnError {
    fn from(err: ReserveError) -> Self {
        match err {
            ReserveError::NameTaken(name) => SpawnError::NameTaken(name),
            ReserveError::Full(capacity) => SpawnError::CapacityExceeded(capacity),
        }
    }
}

fn validate_name(name: &str) -> Result<(), SpawnError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SpawnError::InvalidName(name.to_string()))
    }
}

pub struct Spawner {
    ctx: AgentContext,
    names: Mutex<NameGenerator>,
    max_agents: usize,
    default_token_budget: Option<u64>,
    root: OnceLock<AgentId>,
}

impl Spawner {
    pub fn new(ctx: AgentContext, config: &HiveConfig) -> Self {
        Self {
            ctx,
            names: Mutex::new(NameGenerator::new(config.naming.tiers.clone())),
            max_agents: config.max_agents,
            default_token_budget: config.lifecycle.default_token_budget,
            root: OnceLock::new(),
        }
    }

    pub fn root_id(&self) -> Option<AgentId> {
        self.root.get().copied()
    }

    /// Bring up the root agent, resuming a persisted root when given one.
    #[instrument(skip_all, fields(name = %name))]
    pub fn spawn_root(
        &self,
        name: &str,
        restored: Option<AgentRecord>,
    ) -> Result<AgentHandle, SpawnError> {
        validate_name(name)?;
        let reservation = self.ctx.registry.reserve(name, self.max_agents)?;
        let init = match restored {
            Some(record) => {
                info!(id = %record.id, state = %record.state, "resuming persisted root");
                AgentInit {
                    id: record.id,
                    name: name.to_string(),
                    kind: AgentKind::Root,
                    parent: None,
                    children: Vec::new(),
                    assignment: record.assignment.clone(),
                    commitments: CommitmentList::default(),
                    token_budget: record.token_budget,
                    tokens_used: record.tokens_used,
                    done_behavior: DoneBehavior::default(),
                    continuation_token: record.continuation_token.clone(),
                    lifecycle: record.lifecycle(),
                }
            }
            None => AgentInit {
                id: AgentId::new(),
                name: name.to_string(),
                kind: AgentKind::Root,
                parent: None,
                children: Vec::new(),
                assignment: None,
                commitments: CommitmentList::default(),
                token_budget: None,
                tokens_used: 0,
                done_behavior: DoneBehavior::default(),
                continuation_token: None,
                lifecycle: Lifecycle::new(),
            },
        };
        write_agent(self.ctx.store.as_ref(), &init.record())?;
        Ok(self.finish(reservation, init, false))
    }

    /// Create an agent under a parent.
    ///
    /// Parent-initiated spawns need an assignment and begin `Working` before
    /// this returns. User-initiated spawns attach under the root and wait in
    /// `Idle` for their first message.
    #[instrument(skip_all, fields(initiator = ?initiator, name = config.name.as_deref()))]
    pub async fn spawn(
        &self,
        initiator: Initiator,
        config: SpawnConfig,
    ) -> Result<AgentHandle, SpawnError> {
        let registry = &self.ctx.registry;
        if registry.len() >= self.max_agents {
            return Err(SpawnError::CapacityExceeded(self.max_agents));
        }

        let (parent_id, start_working) = match initiator {
            Initiator::Parent(id) => {
                let has_assignment = config
                    .assignment
                    .as_deref()
                    .is_some_and(|text| !text.trim().is_empty());
                if !has_assignment {
                    return Err(SpawnError::MissingAssignment);
                }
                (id, true)
            }
            Initiator::User => {
                let root = self.root_id().ok_or(SpawnError::NoRoot)?;
                (root, false)
            }
        };
        let parent = registry
            .get(parent_id)
            .ok_or(SpawnError::ParentNotFound(parent_id))?;
        let parent_state = parent.state();
        if parent_state.is_terminal() {
            return Err(SpawnError::ParentTerminal {
                id: parent_id,
                state: parent_state,
            });
        }

        let reservation = match config.name.as_deref().map(str::trim) {
            Some(name) => {
                validate_name(name)?;
                registry.reserve(name, self.max_agents)?
            }
            None => self.reserve_generated_name()?,
        };

        let init = AgentInit {
            id: AgentId::new(),
            name: reservation.name().to_string(),
            kind: AgentKind::Mortal,
            parent: Some(parent_id),
            children: Vec::new(),
            assignment: config.assignment,
            commitments: CommitmentList::new(config.initial_commitments),
            token_budget: config.token_budget.or(self.default_token_budget),
            tokens_used: 0,
            done_behavior: config.done_behavior,
            continuation_token: None,
            lifecycle: Lifecycle::new(),
        };

        let persisted = write_agent(self.ctx.store.as_ref(), &init.record())
            .and_then(|()| write_commitments(self.ctx.store.as_ref(), init.id, &init.commitments));
        if let Err(err) = persisted {
            warn!(err = %err, "initial document write failed; abandoning spawn");
            return Err(err.into());
        }

        // The child is registered before the parent records it, so a parent
        // that leaves the tree in between always finds the child to reap.
        let handle = self.finish(reservation, init, start_working);
        if !parent.attach_child(handle.id()).await {
            let state = parent.state();
            warn!(parent = %parent_id, %state, "parent left the tree during spawn; reaping child");
            handle.reap(ReapReason::ParentReaped);
            return Err(SpawnError::ParentTerminal {
                id: parent_id,
                state,
            });
        }
        Ok(handle)
    }

    fn reserve_generated_name(&self) -> Result<Reservation, SpawnError> {
        let registry = &self.ctx.registry;
        let mut names = match self.names.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut last_err = None;
        for _ in 0..NAME_ATTEMPTS {
            let candidate = names.next_name(|name| registry.contains_name(name));
            match registry.reserve(&candidate, self.max_agents) {
                Ok(reservation) => return Ok(reservation),
                // Lost a race for this name; take the next one.
                Err(ReserveError::NameTaken(name)) => last_err = Some(SpawnError::NameTaken(name)),
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err.unwrap_or(SpawnError::CapacityExceeded(self.max_agents)))
    }

    fn finish(&self, reservation: Reservation, init: AgentInit, start_working: bool) -> AgentHandle {
        if init.kind.is_immortal() {
            let _ = self.root.set(init.id);
        }
        self.ctx.events.publish(Notification::Spawned {
            agent_id: init.id,
            agent_name: init.name.clone(),
            parent: init.parent,
            timestamp: Utc::now(),
        });
        info!(id = %init.id, name = %init.name, kind = init.kind.as_str(), start_working, "agent spawned");
        let handle = launch(self.ctx.clone(), init, start_working);
        reservation.commit(handle.clone());
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::commitment::Check;
    use crate::io::records::read_agent;
    use crate::test_support::{ScriptedChecks, ScriptedMessenger, harness, test_config};

    #[tokio::test]
    async fn parent_initiated_spawn_starts_working() {
        let messenger = Arc::new(ScriptedMessenger::new().reply_with("still going"));
        let h = harness(test_config(), messenger, Arc::new(ScriptedChecks::new())).await;
        let root = h.orchestrator.root().id();
        let handle = h
            .orchestrator
            .spawner()
            .spawn(Initiator::Parent(root), SpawnConfig::assigned("build X"))
            .await
            .expect("spawn");
        assert_eq!(handle.state(), AgentState::Working);
        assert_eq!(handle.parent(), Some(root));
        assert_eq!(handle.name(), "ada");

        let record = read_agent(h.store.as_ref(), handle.id()).expect("persisted");
        assert_eq!(record.assignment.as_deref(), Some("build X"));
        let root_snapshot = h
            .orchestrator
            .root()
            .wait_for(|s| s.children.contains(&handle.id()))
            .await
            .expect("root lists child");
        assert_eq!(root_snapshot.children.len(), 1);
    }

    #[tokio::test]
    async fn parent_initiated_spawn_requires_assignment() {
        let h = harness(test_config(), Arc::new(ScriptedMessenger::new()), Arc::new(ScriptedChecks::new())).await;
        let root = h.orchestrator.root().id();
        let err = h
            .orchestrator
            .spawner()
            .spawn(Initiator::Parent(root), SpawnConfig::default().named("ada"))
            .await
            .expect_err("missing assignment");
        assert!(matches!(err, SpawnError::MissingAssignment));
        assert!(h.orchestrator.agent_by_name("ada").is_none());
    }

    #[tokio::test]
    async fn colliding_names_yield_one_agent() {
        let h = harness(test_config(), Arc::new(ScriptedMessenger::new()), Arc::new(ScriptedChecks::new())).await;
        let spawner = h.orchestrator.spawner();
        let first = spawner
            .spawn(Initiator::User, SpawnConfig::default().named("scout"))
            .await;
        let second = spawner
            .spawn(Initiator::User, SpawnConfig::default().named("scout"))
            .await;
        assert!(first.is_ok());
        assert!(matches!(second, Err(SpawnError::NameTaken(name)) if name == "scout"));
        let live: Vec<_> = h
            .orchestrator
            .status()
            .into_iter()
            .filter(|s| s.name == "scout")
            .collect();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let h = harness(test_config(), Arc::new(ScriptedMessenger::new()), Arc::new(ScriptedChecks::new())).await;
        let err = h
            .orchestrator
            .spawner()
            .spawn(Initiator::User, SpawnConfig::default().named("../etc"))
            .await
            .expect_err("invalid");
        assert!(matches!(err, SpawnError::InvalidName(_)));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let mut config = test_config();
        config.max_agents = 2;
        let h = harness(config, Arc::new(ScriptedMessenger::new()), Arc::new(ScriptedChecks::new())).await;
        let spawner = h.orchestrator.spawner();
        spawner
            .spawn(Initiator::User, SpawnConfig::default())
            .await
            .expect("first worker");
        let err = spawner
            .spawn(Initiator::User, SpawnConfig::default())
            .await
            .expect_err("full");
        assert!(matches!(err, SpawnError::CapacityExceeded(2)));
    }

    #[tokio::test]
    async fn generated_names_follow_tiers() {
        let h = harness(test_config(), Arc::new(ScriptedMessenger::new()), Arc::new(ScriptedChecks::new())).await;
        let spawner = h.orchestrator.spawner();
        let mut names = Vec::new();
        for _ in 0..3 {
            let handle = spawner
                .spawn(Initiator::User, SpawnConfig::default())
                .await
                .expect("spawn");
            names.push(handle.name().to_string());
        }
        assert_eq!(names, vec!["ada", "bee", "cog"]);
    }

    #[tokio::test]
    async fn children_can_spawn_children() {
        let messenger = Arc::new(ScriptedMessenger::new().reply_with("thinking"));
        let h = harness(test_config(), messenger, Arc::new(ScriptedChecks::new())).await;
        let spawner = h.orchestrator.spawner();
        let root = h.orchestrator.root().id();
        let lead = spawner
            .spawn(
                Initiator::Parent(root),
                SpawnConfig::assigned("lead the build")
                    .with_commitment(Commitment::new("builds", Check::shell("true"))),
            )
            .await
            .expect("lead");
        let helper = spawner
            .spawn(Initiator::Parent(lead.id()), SpawnConfig::assigned("write tests"))
            .await
            .expect("helper");
        assert_eq!(helper.parent(), Some(lead.id()));
        lead.wait_for(|s| s.children == vec![helper.id()])
            .await
            .expect("lead lists helper");
        assert!(h.orchestrator.validate().is_empty());
    }
}
