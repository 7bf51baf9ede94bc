//! Name-unique, id-addressable directory of live agents.
//!
//! Names are claimed in two steps: [`Registry::reserve`] holds a name (and a
//! capacity slot) while the spawner builds the agent, then
//! [`Reservation::commit`] publishes the handle. Dropping an uncommitted
//! reservation releases the name, so a failed spawn leaves nothing behind.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::agent::AgentHandle;
use crate::core::types::AgentId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReserveError {
    #[error("name '{0}' is already taken")]
    NameTaken(String),
    #[error("agent capacity {0} reached")]
    Full(usize),
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<AgentId, AgentHandle>,
    by_name: HashMap<String, AgentId>,
    reserved: HashSet<String>,
    /// Ids of agents that have left the tree, so repeated dismissals can be
    /// told apart from unknown ids. Grows by one id per retired agent for the
    /// life of the process; ids are never reused.
    retired: HashSet<AgentId>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim `name`, counting it against `capacity` until committed or dropped.
    pub fn reserve(self: &Arc<Self>, name: &str, capacity: usize) -> Result<Reservation, ReserveError> {
        let mut inner = self.lock();
        if inner.by_name.contains_key(name) || inner.reserved.contains(name) {
            return Err(ReserveError::NameTaken(name.to_string()));
        }
        if inner.by_id.len() + inner.reserved.len() >= capacity {
            return Err(ReserveError::Full(capacity));
        }
        inner.reserved.insert(name.to_string());
        Ok(Reservation {
            registry: self.clone(),
            name: name.to_string(),
            committed: false,
        })
    }

    pub fn get(&self, id: AgentId) -> Option<AgentHandle> {
        self.lock().by_id.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<AgentHandle> {
        let inner = self.lock();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// True while a live agent or a pending spawn holds `name`.
    pub fn contains_name(&self, name: &str) -> bool {
        let inner = self.lock();
        inner.by_name.contains_key(name) || inner.reserved.contains(name)
    }

    /// Remove a live agent. Its id is remembered as retired; its name is freed.
    pub fn remove(&self, id: AgentId) -> Option<AgentHandle> {
        let mut inner = self.lock();
        let handle = inner.by_id.remove(&id)?;
        inner.by_name.remove(handle.name());
        inner.retired.insert(id);
        Some(handle)
    }

    pub fn is_retired(&self, id: AgentId) -> bool {
        self.lock().retired.contains(&id)
    }

    /// Live agents, sorted by name.
    pub fn live(&self) -> Vec<AgentHandle> {
        let mut handles: Vec<_> = self.lock().by_id.values().cloned().collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    /// Live agents plus pending reservations.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.by_id.len() + inner.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A held name. Commit to publish the agent; drop to release.
pub struct Reservation {
    registry: Arc<Registry>,
    name: String,
    committed: bool,
}

impl Reservation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commit(mut self, handle: AgentHandle) {
        let mut inner = self.registry.lock();
        inner.reserved.remove(&self.name);
        inner.by_name.insert(self.name.clone(), handle.id());
        inner.by_id.insert(handle.id(), handle);
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.lock().reserved.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentHandle;
    use crate::core::types::AgentKind;

    #[test]
    fn reserved_names_are_taken_until_dropped() {
        let registry = Arc::new(Registry::new());
        let held = registry.reserve("ada", 10).expect("reserve");
        assert_eq!(
            registry.reserve("ada", 10).err(),
            Some(ReserveError::NameTaken("ada".into()))
        );
        assert!(registry.contains_name("ada"));
        drop(held);
        assert!(!registry.contains_name("ada"));
        assert!(registry.is_empty());
    }

    #[test]
    fn reservations_count_against_capacity() {
        let registry = Arc::new(Registry::new());
        let _a = registry.reserve("ada", 2).expect("first");
        let _b = registry.reserve("bee", 2).expect("second");
        assert_eq!(registry.reserve("cog", 2).err(), Some(ReserveError::Full(2)));
    }

    #[test]
    fn committed_agents_are_addressable_and_removal_frees_name() {
        let registry = Arc::new(Registry::new());
        let (handle, _commands) = AgentHandle::detached("ada", AgentKind::Mortal);
        let id = handle.id();
        registry.reserve("ada", 10).expect("reserve").commit(handle);

        assert_eq!(registry.get(id).map(|h| h.id()), Some(id));
        assert_eq!(registry.find_by_name("ada").map(|h| h.id()), Some(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id).is_some());
        assert!(registry.is_retired(id));
        assert!(registry.get(id).is_none());
        assert!(!registry.contains_name("ada"));
        assert!(registry.remove(id).is_none());
    }
}
