//! Environment contracts consumed by the trainer.
//!
//! The tracking simulation itself lives outside this crate. The trainer only
//! talks to a [`VecMultiAgentEnv`]: a batch of `num_envs` simulations stepped
//! together, each holding the same set of agents and emitting one shared
//! reward and done flag per instance.
//!
//! Single simulations implementing [`MultiAgentEnv`] can be batched with
//! [`SyncVecEnv`], which also applies the episode time limit and reports
//! finished-episode statistics.

pub mod sync;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::agents::AgentMap;
use crate::error::Result;
use crate::spaces::{ActionSpace, ObservationSpace};

pub use sync::SyncVecEnv;

/// Return and length of an episode that finished during a step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EpisodeStats {
    /// Index of the environment instance that finished.
    pub env_index: usize,
    /// Undiscounted sum of shared rewards (`r`).
    pub episode_return: f64,
    /// Number of steps in the episode (`l`).
    pub length: usize,
}

/// Result of stepping one environment instance.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Next per-agent observation, each flattened to `targets * features`.
    pub observations: AgentMap<Vec<f32>>,
    /// Shared team reward.
    pub reward: f32,
    /// Whether the episode terminated.
    pub done: bool,
}

/// Result of stepping every instance of a vectorized environment.
#[derive(Debug, Clone)]
pub struct VecStepResult {
    /// Per-agent observations, `num_envs * obs_dim` values each, env-major.
    pub observations: AgentMap<Vec<f32>>,
    /// One shared reward per environment.
    pub rewards: Vec<f32>,
    /// One done flag per environment.
    pub dones: Vec<bool>,
    /// One record per environment whose episode ended on this step.
    pub episodes: Vec<EpisodeStats>,
}

/// A single multi-agent tracking simulation.
pub trait MultiAgentEnv {
    fn observation_space(&self) -> &ObservationSpace;

    fn action_space(&self) -> &ActionSpace;

    /// Starts a new episode and returns the initial observations.
    fn reset(&mut self) -> Result<AgentMap<Vec<f32>>>;

    /// Applies one action per agent.
    fn step(&mut self, actions: &AgentMap<i64>) -> Result<StepResult>;
}

/// A batch of simulations stepped in lockstep.
pub trait VecMultiAgentEnv {
    fn num_envs(&self) -> usize;

    fn single_observation_space(&self) -> &ObservationSpace;

    fn single_action_space(&self) -> &ActionSpace;

    fn reset(&mut self) -> Result<AgentMap<Vec<f32>>>;

    /// Steps every instance; `actions[j]` holds the choices for instance `j`.
    fn step(&mut self, actions: &[AgentMap<i64>]) -> Result<VecStepResult>;
}
