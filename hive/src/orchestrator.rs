//! The root of the hive and the tool interface offered to the outside.
//!
//! [`Orchestrator::start`] wires the process-wide services (registry, event
//! bus, call gate, verifier) once and brings up the root agent. The tool
//! calls (`summon_worker`, `dismiss_worker`, `send_message`) and status
//! queries all go through here.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::agent::{
    AgentContext, AgentHandle, AgentSettings, AgentSnapshot, Dismissal, Origin,
};
use crate::core::commitment::{Commitment, CommitmentStatus};
use crate::core::invariants::{NodeView, validate_tree};
use crate::core::types::{AgentId, AgentKind, AgentState, ReapReason};
use crate::events::{Event, EventBus};
use crate::io::checks::{CheckRequest, CheckRunner, ShellCheckRunner};
use crate::io::config::HiveConfig;
use crate::io::init::HivePaths;
use crate::io::messenger::{CliMessenger, Messenger};
use crate::io::prompt::PromptEngine;
use crate::io::records::{AgentRecord, load_agents, write_agent};
use crate::io::store::{FileStore, Store};
use crate::registry::Registry;
use crate::sidecar::{CallGate, RetryPolicy, Sidecar};
use crate::spawner::{Initiator, SpawnConfig, SpawnError, Spawner};
use crate::verifier::Verifier;

/// Failures of the tool interface.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("agent {0} not found")]
    NotFound(AgentId),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("agent {0} has exited")]
    AgentGone(AgentId),
    #[error("agent {id} is {state}")]
    AgentTerminal { id: AgentId, state: AgentState },
    #[error("agent {0} is verifying; retry once verification resolves")]
    Verifying(AgentId),
    #[error("the root agent cannot be dismissed")]
    RootImmortal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Ack {
    Dismissed,
    /// Applied once the agent's verification resolves.
    Deferred,
    /// The agent had already left the tree.
    AlreadyDismissed,
}

/// External collaborators the core consumes.
pub struct Services {
    pub store: Arc<dyn Store>,
    pub messenger: Arc<dyn Messenger>,
    pub checks: Arc<dyn CheckRunner>,
}

impl Services {
    /// File-backed store, CLI messenger, and shell checks.
    pub fn from_config(config: &HiveConfig, paths: &HivePaths) -> Self {
        Self {
            store: Arc::new(FileStore::new(&paths.store_dir)),
            messenger: Arc::new(CliMessenger::new(&config.messenger)),
            checks: Arc::new(ShellCheckRunner::new(config.verifier.shell.clone())),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    store: Arc<dyn Store>,
    gate: CallGate,
    spawner: Spawner,
    root: AgentHandle,
}

impl Orchestrator {
    /// Wire services and bring up the root. Must run inside a tokio runtime.
    ///
    /// Agents left live by a previous process are marked retired; a persisted
    /// root is resumed under its old id and continuation token.
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    pub fn start(config: &HiveConfig, workdir: PathBuf, services: Services) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new());
        let events = Arc::new(EventBus::open(services.store.clone()).context("open event log")?);
        let gate = CallGate::new(config.messenger.max_in_flight);
        let sidecar = Arc::new(Sidecar::new(
            services.messenger,
            gate.clone(),
            RetryPolicy::from_config(&config.messenger),
            config.messenger_timeout(),
        ));
        let verifier = Verifier::new(
            services.checks,
            CheckRequest {
                workdir: workdir.clone(),
                timeout: config.verifier_timeout(),
                output_limit_bytes: config.verifier.output_limit_bytes,
            },
        );
        let ctx = AgentContext {
            registry: registry.clone(),
            events: events.clone(),
            store: services.store.clone(),
            sidecar,
            verifier,
            prompts: Arc::new(PromptEngine::new()),
            classifier: Arc::new(config.classifier.build()?),
            settings: AgentSettings::from_config(config, workdir),
        };

        let restored_root = retire_previous(services.store.as_ref())?;
        let spawner = Spawner::new(ctx, config);
        let root = spawner
            .spawn_root(&config.naming.root_name, restored_root)
            .context("spawn root agent")?;
        info!(root = %root.id(), max_in_flight = gate.capacity(), "orchestrator started");

        Ok(Self {
            registry,
            events,
            store: services.store,
            gate,
            spawner,
            root,
        })
    }

    pub fn root(&self) -> &AgentHandle {
        &self.root
    }

    pub fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Messenger calls currently holding a gate slot.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn agent(&self, id: AgentId) -> Option<AgentHandle> {
        self.registry.get(id)
    }

    pub fn agent_by_name(&self, name: &str) -> Option<AgentHandle> {
        self.registry.find_by_name(name)
    }

    /// Summon a worker for the user.
    ///
    /// With an assignment the root delegates it and the worker starts
    /// working at once; without one the worker waits `Idle` for a message.
    pub async fn summon_worker(
        &self,
        assignment: Option<String>,
        name: Option<String>,
    ) -> Result<AgentId, ToolError> {
        let config = SpawnConfig {
            assignment,
            name,
            ..SpawnConfig::default()
        };
        let initiator = if config.assignment.is_some() {
            Initiator::Parent(self.root.id())
        } else {
            Initiator::User
        };
        self.summon(initiator, config).await
    }

    /// Spawn with full options. Repeating a call with the same explicit
    /// name, parent, and assignment returns the existing agent.
    pub async fn summon(&self, initiator: Initiator, config: SpawnConfig) -> Result<AgentId, ToolError> {
        if let Some(existing) = config
            .name
            .as_deref()
            .and_then(|name| self.registry.find_by_name(name.trim()))
        {
            let parent = match initiator {
                Initiator::Parent(id) => id,
                Initiator::User => self.root.id(),
            };
            let snapshot = existing.snapshot();
            if snapshot.parent == Some(parent) && snapshot.assignment == config.assignment {
                info!(id = %existing.id(), name = existing.name(), "summon repeated; returning existing agent");
                return Ok(existing.id());
            }
        }
        let handle = self.spawner.spawn(initiator, config).await?;
        Ok(handle.id())
    }

    #[instrument(skip(self))]
    pub async fn dismiss_worker(&self, id: AgentId) -> Result<Ack, ToolError> {
        if id == self.root.id() {
            return Err(ToolError::RootImmortal);
        }
        let Some(handle) = self.registry.get(id) else {
            return if self.registry.is_retired(id) {
                Ok(Ack::AlreadyDismissed)
            } else {
                Err(ToolError::NotFound(id))
            };
        };
        match handle.dismiss().await {
            Ok(Dismissal::Dismissed) => Ok(Ack::Dismissed),
            Ok(Dismissal::Deferred) => Ok(Ack::Deferred),
            Err(ToolError::AgentGone(_)) => Ok(Ack::AlreadyDismissed),
            Err(err) => Err(err),
        }
    }

    /// Send a user message to an agent.
    pub fn send_message(&self, id: AgentId, text: &str) -> Result<(), ToolError> {
        self.live_handle(id)?.send(Origin::User, "user", text)
    }

    pub async fn add_commitment(&self, id: AgentId, commitment: Commitment) -> Result<(), ToolError> {
        self.live_handle(id)?.add_commitment(commitment).await
    }

    fn live_handle(&self, id: AgentId) -> Result<AgentHandle, ToolError> {
        match self.registry.get(id) {
            Some(handle) => Ok(handle),
            None if self.registry.is_retired(id) => Err(ToolError::AgentGone(id)),
            None => Err(ToolError::NotFound(id)),
        }
    }

    /// Snapshots of every live agent, root first, children depth-first.
    pub fn status(&self) -> Vec<AgentSnapshot> {
        let snapshots: HashMap<AgentId, AgentSnapshot> = self
            .registry
            .live()
            .iter()
            .map(|handle| (handle.id(), handle.snapshot()))
            .collect();
        let mut ordered = Vec::with_capacity(snapshots.len());
        let mut stack = vec![self.root.id()];
        while let Some(id) = stack.pop() {
            if let Some(snapshot) = snapshots.get(&id) {
                stack.extend(snapshot.children.iter().rev().copied());
                ordered.push(snapshot.clone());
            }
        }
        // Agents mid-spawn may not be listed by their parent yet.
        let mut stragglers: Vec<_> = snapshots
            .into_values()
            .filter(|snapshot| !ordered.iter().any(|seen| seen.id == snapshot.id))
            .collect();
        stragglers.sort_by(|a, b| a.name.cmp(&b.name));
        ordered.extend(stragglers);
        ordered
    }

    /// Indented, human-readable tree of live agents.
    pub fn tree(&self) -> String {
        let snapshots = self.status();
        let depths = depths(&snapshots);
        let mut buf = String::new();
        for snapshot in &snapshots {
            let depth = depths.get(&snapshot.id).copied().unwrap_or(0);
            let _ = write!(
                buf,
                "{}{} [{}] tokens={}",
                "  ".repeat(depth),
                snapshot.name,
                snapshot.state,
                snapshot.tokens_used
            );
            if !snapshot.commitments.is_empty() {
                let passed = snapshot
                    .commitments
                    .iter()
                    .filter(|c| c.status() == CommitmentStatus::Passed)
                    .count();
                let _ = write!(buf, " commitments={passed}/{}", snapshot.commitments.len());
            }
            buf.push('\n');
        }
        buf
    }

    /// Tree invariant violations over the live agents (empty when healthy).
    pub fn validate(&self) -> Vec<String> {
        let nodes: Vec<NodeView> = self
            .status()
            .into_iter()
            .map(|snapshot| NodeView {
                id: snapshot.id,
                name: snapshot.name,
                kind: snapshot.kind,
                parent: snapshot.parent,
                children: snapshot.children,
            })
            .collect();
        validate_tree(&nodes)
    }

    /// Reap every worker under the root. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let mut signalled = 0;
        for handle in self.registry.live() {
            if handle.parent() == Some(self.root.id()) && handle.reap(ReapReason::ExternalReap) {
                signalled += 1;
            }
        }
        info!(signalled, "shutting down workers");
        signalled
    }
}

fn depths(snapshots: &[AgentSnapshot]) -> HashMap<AgentId, usize> {
    let parents: HashMap<AgentId, Option<AgentId>> =
        snapshots.iter().map(|s| (s.id, s.parent)).collect();
    snapshots
        .iter()
        .map(|snapshot| {
            let mut depth = 0;
            let mut cursor = snapshot.parent;
            while let Some(parent) = cursor {
                depth += 1;
                cursor = parents.get(&parent).copied().flatten();
                if depth > snapshots.len() {
                    break;
                }
            }
            (snapshot.id, depth)
        })
        .collect()
}

/// Mark agents a previous process left live as retired, returning the
/// persisted root (if any) so it can be resumed.
fn retire_previous(store: &dyn Store) -> Result<Option<AgentRecord>> {
    let mut root = None;
    let mut retired = 0usize;
    for mut record in load_agents(store).context("load persisted agents")? {
        if record.retired {
            continue;
        }
        if record.kind == AgentKind::Root && root.is_none() {
            root = Some(record);
            continue;
        }
        record.retired = true;
        write_agent(store, &record)
            .with_context(|| format!("retire stale agent {}", record.name))?;
        retired += 1;
    }
    if retired > 0 {
        info!(retired, "retired agents left over from a previous run");
    }
    Ok(root)
}
