//! Notification stream exposed to the outside collaborator.
//!
//! Every notification gets a sequence number, is persisted under `events/`,
//! and is then broadcast to live subscribers. A subscriber that connects
//! late (or a restarted process) rebuilds history with [`EventBus::replay`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::core::types::{AgentId, AgentState};
use crate::io::document::Document;
use crate::io::store::{Store, StoreError};

pub const EVENTS_PREFIX: &str = "events/";
const CHANNEL_CAPACITY: usize = 1024;

/// Where a bubbled message is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum Destination {
    Agent(AgentId),
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Agent is waiting for input.
    Question,
    VerificationFailed,
    Completed,
    Reaped,
    /// A message could not reach its destination.
    DeliveryFailure,
    /// An internal error with a visible consequence (e.g. a failed write).
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BubbledMessage {
    pub kind: MessageKind,
    pub text: String,
    /// Agents the message passed through before this point.
    pub hops: u32,
}

impl BubbledMessage {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            hops: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Notification {
    StateChanged {
        agent_id: AgentId,
        agent_name: String,
        old_state: AgentState,
        new_state: AgentState,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Bubbled {
        agent_id: AgentId,
        agent_name: String,
        destination: Destination,
        message: BubbledMessage,
        timestamp: DateTime<Utc>,
    },
    Spawned {
        agent_id: AgentId,
        agent_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<AgentId>,
        timestamp: DateTime<Utc>,
    },
    Retired {
        agent_id: AgentId,
        agent_name: String,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    pub fn agent_id(&self) -> AgentId {
        match self {
            Notification::StateChanged { agent_id, .. }
            | Notification::Bubbled { agent_id, .. }
            | Notification::Spawned { agent_id, .. }
            | Notification::Retired { agent_id, .. } => *agent_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Notification::StateChanged { .. } => "stateChanged",
            Notification::Bubbled { .. } => "bubbled",
            Notification::Spawned { .. } => "spawned",
            Notification::Retired { .. } => "retired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub notification: Notification,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventMeta {
    seq: u64,
    kind: String,
    agent_id: AgentId,
}

pub fn event_key(seq: u64) -> String {
    format!("{EVENTS_PREFIX}{seq:012}")
}

/// Ordered, persisted broadcast of notifications.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    store: Arc<dyn Store>,
    next_seq: Mutex<u64>,
}

impl EventBus {
    /// Open the bus, continuing numbering after any persisted events.
    pub fn open(store: Arc<dyn Store>) -> Result<Self, StoreError> {
        let next_seq = store
            .list(EVENTS_PREFIX)?
            .iter()
            .filter_map(|key| key[EVENTS_PREFIX.len()..].parse::<u64>().ok())
            .max()
            .map_or(0, |last| last + 1);
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            sender,
            store,
            next_seq: Mutex::new(next_seq),
        })
    }

    /// Number, persist, then broadcast. A persistence failure is logged and
    /// the event is still broadcast.
    pub fn publish(&self, notification: Notification) -> Event {
        let mut next_seq = match self.next_seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let event = Event {
            seq: *next_seq,
            notification,
        };
        *next_seq += 1;
        if let Err(err) = self.persist(&event) {
            error!(seq = event.seq, err = %err, "failed to persist event");
        }
        debug!(seq = event.seq, kind = event.notification.label(), agent = %event.notification.agent_id(), "event published");
        // No subscribers is not an error; replay covers them.
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    fn persist(&self, event: &Event) -> Result<(), StoreError> {
        let key = event_key(event.seq);
        let meta = EventMeta {
            seq: event.seq,
            kind: event.notification.label().to_string(),
            agent_id: event.notification.agent_id(),
        };
        let body = serde_json::to_string_pretty(&event.notification)
            .map_err(|err| StoreError::Backend(err.into()))?;
        let doc = Document::from_meta(&meta, body).map_err(|source| StoreError::Malformed {
            key: key.clone(),
            source,
        })?;
        self.store.write(&key, &doc)
    }

    /// All persisted events in sequence order.
    pub fn replay(store: &dyn Store) -> Result<Vec<Event>, StoreError> {
        let mut events = Vec::new();
        for key in store.list(EVENTS_PREFIX)? {
            let doc = store.read(&key)?;
            let meta: EventMeta = doc.meta_as().map_err(|source| StoreError::Malformed {
                key: key.clone(),
                source,
            })?;
            let notification: Notification = serde_json::from_str(&doc.body)
                .map_err(|err| StoreError::Backend(anyhow::Error::new(err).context(key.clone())))?;
            events.push(Event {
                seq: meta.seq,
                notification,
            });
        }
        events.sort_by_key(|event| event.seq);
        Ok(events)
    }
}
