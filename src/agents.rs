//! Agent identifiers, agent-keyed maps, and the fixed agent roster.
//!
//! Environments hand back observations keyed by agent id. The position of
//! an agent in the trajectory buffer is taken from the [`AgentRoster`] built
//! once at startup, never from whatever order a mapping happens to iterate
//! in. Every mapping received afterwards is checked against the roster.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Identifier of a tracking agent, e.g. `"agent-0"`.
pub type AgentId = String;

/// Insertion-ordered map from agent id to a value.
///
/// Used for observation mappings (`AgentMap<Vec<f32>>`, one row per env) and
/// per-environment action choices (`AgentMap<i64>`).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentMap<T> {
    entries: Vec<(AgentId, T)>,
}

impl<T> AgentMap<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts or replaces the value for `agent`, keeping first-insertion order.
    pub fn insert(&mut self, agent: impl Into<AgentId>, value: T) {
        let agent = agent.into();
        match self.entries.iter_mut().find(|(a, _)| *a == agent) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((agent, value)),
        }
    }

    pub fn get(&self, agent: &str) -> Option<&T> {
        self.entries.iter().find(|(a, _)| a == agent).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &AgentId> {
        self.entries.iter().map(|(a, _)| a)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &T)> {
        self.entries.iter().map(|(a, v)| (a, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for AgentMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S: Into<AgentId>> FromIterator<(S, T)> for AgentMap<T> {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        let mut map = AgentMap::new();
        for (agent, value) in iter {
            map.insert(agent, value);
        }
        map
    }
}

/// Ordered list of agents whose positions define the agent axis of the
/// trajectory buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRoster {
    ids: Vec<AgentId>,
}

impl AgentRoster {
    /// Builds a roster from an explicit id list. Ids must be unique.
    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        let ids: Vec<AgentId> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Err(TrainError::EmptyAgentSet);
        }
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                return Err(TrainError::InvalidConfig(format!(
                    "duplicate agent id {id}"
                )));
            }
        }
        Ok(Self { ids })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentId> {
        self.ids.iter()
    }

    pub fn index_of(&self, agent: &str) -> Option<usize> {
        self.ids.iter().position(|a| a == agent)
    }

    pub fn ids(&self) -> &[AgentId] {
        &self.ids
    }

    /// Fails unless `map` holds exactly the roster's agents in roster order.
    pub fn conform<T>(&self, map: &AgentMap<T>) -> Result<()> {
        if map.len() == self.ids.len() && map.keys().zip(&self.ids).all(|(a, b)| a == b) {
            return Ok(());
        }
        Err(TrainError::AgentOrderMismatch {
            expected: self.ids.clone(),
            actual: map.keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> AgentRoster {
        AgentRoster::new(["agent-0", "agent-1", "agent-2"]).unwrap()
    }

    #[test]
    fn agent_map_keeps_insertion_order() {
        let mut map = AgentMap::new();
        map.insert("agent-1", 1);
        map.insert("agent-0", 0);
        map.insert("agent-1", 10);
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["agent-1", "agent-0"]);
        assert_eq!(map.get("agent-1"), Some(&10));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn roster_rejects_duplicates_and_empty() {
        assert!(AgentRoster::new(["a", "a"]).is_err());
        assert!(matches!(
            AgentRoster::new(Vec::<String>::new()),
            Err(TrainError::EmptyAgentSet)
        ));
    }

    #[test]
    fn conform_accepts_roster_order() {
        let map: AgentMap<u8> = [("agent-0", 0), ("agent-1", 1), ("agent-2", 2)]
            .into_iter()
            .collect();
        assert!(roster().conform(&map).is_ok());
        assert_eq!(roster().index_of("agent-2"), Some(2));
    }

    #[test]
    fn conform_detects_reordering() {
        let map: AgentMap<u8> = [("agent-1", 1), ("agent-0", 0), ("agent-2", 2)]
            .into_iter()
            .collect();
        assert!(matches!(
            roster().conform(&map),
            Err(TrainError::AgentOrderMismatch { .. })
        ));
    }

    #[test]
    fn conform_detects_missing_agent() {
        let map: AgentMap<u8> = [("agent-0", 0), ("agent-1", 1)].into_iter().collect();
        assert!(roster().conform(&map).is_err());
    }
}
