//! Agent and commitment documents.
//!
//! One document per agent node (`agents/<id>`) and one per commitment set
//! (`commitments/<id>`). The agent's assignment is the document body.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::commitment::{CommitmentList, CommitmentStatus};
use crate::core::lifecycle::Lifecycle;
use crate::core::types::{AgentId, AgentKind, AgentState, DoneBehavior, ReapReason, TransitionRecord};
use crate::io::document::Document;
use crate::io::store::{Store, StoreError};

pub const AGENTS_PREFIX: &str = "agents/";
pub const COMMITMENTS_PREFIX: &str = "commitments/";

pub fn agent_key(id: AgentId) -> String {
    format!("{AGENTS_PREFIX}{id}")
}

pub fn commitments_key(id: AgentId) -> String {
    format!("{COMMITMENTS_PREFIX}{id}")
}

/// Persisted view of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub state: AgentState,
    pub assignment: Option<String>,
    pub parent: Option<AgentId>,
    pub children: Vec<AgentId>,
    pub continuation_token: Option<String>,
    pub token_budget: Option<u64>,
    pub tokens_used: u64,
    pub done_behavior: DoneBehavior,
    /// Removed from the registry; no longer live.
    pub retired: bool,
    pub reap_reason: Option<ReapReason>,
    pub transitions: Vec<TransitionRecord>,
}

impl AgentRecord {
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::restore(self.state, self.transitions.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AgentMeta {
    id: AgentId,
    name: String,
    kind: AgentKind,
    state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<AgentId>,
    #[serde(default)]
    children: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    continuation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_budget: Option<u64>,
    #[serde(default)]
    tokens_used: u64,
    #[serde(default)]
    done_behavior: DoneBehavior,
    #[serde(default)]
    retired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reap_reason: Option<ReapReason>,
    #[serde(default)]
    has_assignment: bool,
    #[serde(default)]
    transitions: Vec<TransitionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitmentsMeta {
    agent_id: AgentId,
    #[serde(default)]
    commitments: CommitmentList,
}

fn malformed(key: &str, source: crate::io::document::DocumentError) -> StoreError {
    StoreError::Malformed {
        key: key.to_string(),
        source,
    }
}

pub fn write_agent(store: &dyn Store, record: &AgentRecord) -> Result<(), StoreError> {
    let key = agent_key(record.id);
    let meta = AgentMeta {
        id: record.id,
        name: record.name.clone(),
        kind: record.kind,
        state: record.state,
        parent: record.parent,
        children: record.children.clone(),
        continuation_token: record.continuation_token.clone(),
        token_budget: record.token_budget,
        tokens_used: record.tokens_used,
        done_behavior: record.done_behavior,
        retired: record.retired,
        reap_reason: record.reap_reason,
        has_assignment: record.assignment.is_some(),
        transitions: record.transitions.clone(),
    };
    let body = record.assignment.clone().unwrap_or_default();
    let doc = Document::from_meta(&meta, body).map_err(|err| malformed(&key, err))?;
    debug!(agent = %record.id, state = %record.state, "persisting agent document");
    store.write(&key, &doc)
}

pub fn read_agent(store: &dyn Store, id: AgentId) -> Result<AgentRecord, StoreError> {
    let key = agent_key(id);
    let doc = store.read(&key)?;
    let meta: AgentMeta = doc.meta_as().map_err(|err| malformed(&key, err))?;
    Ok(AgentRecord {
        id: meta.id,
        name: meta.name,
        kind: meta.kind,
        state: meta.state,
        assignment: meta.has_assignment.then_some(doc.body),
        parent: meta.parent,
        children: meta.children,
        continuation_token: meta.continuation_token,
        token_budget: meta.token_budget,
        tokens_used: meta.tokens_used,
        done_behavior: meta.done_behavior,
        retired: meta.retired,
        reap_reason: meta.reap_reason,
        transitions: meta.transitions,
    })
}

/// Load every persisted agent, sorted by name.
pub fn load_agents(store: &dyn Store) -> Result<Vec<AgentRecord>, StoreError> {
    let mut records = Vec::new();
    for key in store.list(AGENTS_PREFIX)? {
        let raw_id = &key[AGENTS_PREFIX.len()..];
        let id = AgentId::parse(raw_id).map_err(|_| StoreError::InvalidKey(key.clone()))?;
        records.push(read_agent(store, id)?);
    }
    records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    Ok(records)
}

pub fn write_commitments(
    store: &dyn Store,
    id: AgentId,
    commitments: &CommitmentList,
) -> Result<(), StoreError> {
    let key = commitments_key(id);
    let meta = CommitmentsMeta {
        agent_id: id,
        commitments: commitments.clone(),
    };
    let doc = Document::from_meta(&meta, render_checklist(commitments))
        .map_err(|err| malformed(&key, err))?;
    store.write(&key, &doc)
}

/// Missing documents read as an empty list.
pub fn read_commitments(store: &dyn Store, id: AgentId) -> Result<CommitmentList, StoreError> {
    let key = commitments_key(id);
    let doc = match store.read(&key) {
        Ok(doc) => doc,
        Err(StoreError::NotFound(_)) => return Ok(CommitmentList::default()),
        Err(err) => return Err(err),
    };
    let meta: CommitmentsMeta = doc.meta_as().map_err(|err| malformed(&key, err))?;
    Ok(meta.commitments)
}

fn render_checklist(commitments: &CommitmentList) -> String {
    let mut buf = String::new();
    for commitment in commitments {
        let mark = match commitment.status() {
            CommitmentStatus::Passed => "x",
            CommitmentStatus::Failed => "!",
            CommitmentStatus::Pending | CommitmentStatus::Verifying => " ",
        };
        buf.push_str(&format!(
            "- [{mark}] {} ({})\n",
            commitment.description(),
            commitment.check()
        ));
    }
    buf
}
