//! Observation and action space descriptors exposed by environments.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::agents::AgentId;
use crate::error::{Result, TrainError};

/// Per-agent observation shapes, in the environment's key order.
///
/// Tracking observations are `[targets, features]` per agent; the network
/// consumes them flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ObservationSpace {
    entries: Vec<(AgentId, Vec<usize>)>,
}

impl ObservationSpace {
    pub fn new(entries: Vec<(AgentId, Vec<usize>)>) -> Self {
        Self { entries }
    }

    /// Same shape for every agent in `agents`.
    pub fn uniform<I, S>(agents: I, shape: &[usize]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        Self {
            entries: agents
                .into_iter()
                .map(|a| (a.into(), shape.to_vec()))
                .collect(),
        }
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentId> {
        self.entries.iter().map(|(a, _)| a)
    }

    pub fn shape_of(&self, agent: &str) -> Option<&[usize]> {
        self.entries
            .iter()
            .find(|(a, _)| a == agent)
            .map(|(_, s)| s.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flattened feature count shared by all agents.
    ///
    /// The network is shared, so every agent must present the same shape.
    pub fn flat_dim(&self) -> Result<usize> {
        let (_, first) = self.entries.first().ok_or(TrainError::EmptyAgentSet)?;
        for (agent, shape) in &self.entries[1..] {
            if shape != first {
                return Err(TrainError::ObservationShapeMismatch {
                    agent: agent.clone(),
                    expected: first.clone(),
                    actual: shape.clone(),
                });
            }
        }
        Ok(first.iter().product())
    }
}

/// Single-instance action space.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ActionSpace {
    /// `n` mutually exclusive choices.
    Discrete { n: usize },
    /// Real-valued actions.
    Continuous { shape: Vec<usize> },
}

impl ActionSpace {
    /// Returns the number of discrete actions, or fails on a continuous space.
    pub fn require_discrete(&self) -> Result<usize> {
        match self {
            ActionSpace::Discrete { n } if *n > 0 => Ok(*n),
            ActionSpace::Discrete { .. } => Err(TrainError::InvalidConfig(
                "discrete action space with zero actions".into(),
            )),
            ActionSpace::Continuous { shape } => {
                Err(TrainError::UnsupportedActionSpace(shape.clone()))
            }
        }
    }
}
