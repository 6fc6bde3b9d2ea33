//! Trajectory buffer indexed by `[time, env, agent]`.

use crate::error::{Result, TrainError};
use crate::policy::PolicyStep;

/// Fixed-size storage for one rollout.
///
/// Per-agent fields (observation, action, log-probability, value) are laid out
/// `[T, E, A, ...]`; the shared reward and done flag are laid out `[T, E]`, so
/// every agent of an environment sees the same signal at the same timestep.
///
/// The buffer is overwritten by each rollout. A rollout may stop before `T`
/// steps; only the first [`TrajectoryBuffer::filled`] timesteps are valid.
#[derive(Debug, Clone)]
pub struct TrajectoryBuffer {
    num_steps: usize,
    num_envs: usize,
    num_agents: usize,
    obs_dim: usize,
    observations: Vec<f32>,
    actions: Vec<i64>,
    log_probs: Vec<f32>,
    values: Vec<f32>,
    rewards: Vec<f32>,
    dones: Vec<bool>,
    filled: usize,
}

/// One agent's slice of a rollout, flattened over `[T, E]` in time-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentBatch {
    /// Row width of `observations`.
    pub obs_dim: usize,
    pub observations: Vec<f32>,
    pub actions: Vec<i64>,
    pub log_probs: Vec<f32>,
    pub values: Vec<f32>,
    pub advantages: Vec<f32>,
    pub returns: Vec<f32>,
}

impl AgentBatch {
    /// Number of transitions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl TrajectoryBuffer {
    /// Allocates a zeroed buffer of shape `[num_steps, num_envs, num_agents]`.
    pub fn new(num_steps: usize, num_envs: usize, num_agents: usize, obs_dim: usize) -> Self {
        let slots = num_steps * num_envs * num_agents;
        Self {
            num_steps,
            num_envs,
            num_agents,
            obs_dim,
            observations: vec![0.0; slots * obs_dim],
            actions: vec![0; slots],
            log_probs: vec![0.0; slots],
            values: vec![0.0; slots],
            rewards: vec![0.0; num_steps * num_envs],
            dones: vec![false; num_steps * num_envs],
            filled: 0,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    /// Number of valid timesteps from the start of the rollout.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Marks the buffer empty for the next rollout. Storage is reused.
    pub fn clear(&mut self) {
        self.filled = 0;
    }

    fn slot(&self, t: usize, env: usize, agent: usize) -> usize {
        debug_assert!(t < self.num_steps && env < self.num_envs && agent < self.num_agents);
        (t * self.num_envs + env) * self.num_agents + agent
    }

    fn expect_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(TrainError::BatchSizeMismatch {
                what,
                expected,
                actual,
            })
        }
    }

    /// Stores one agent's observations for all envs at timestep `t`.
    ///
    /// `observations` holds `num_envs` rows of `obs_dim` values.
    pub fn record_observations(&mut self, t: usize, agent: usize, observations: &[f32]) -> Result<()> {
        Self::expect_len("observation rows", self.num_envs * self.obs_dim, observations.len())?;
        for (env, row) in observations.chunks_exact(self.obs_dim).enumerate() {
            let start = self.slot(t, env, agent) * self.obs_dim;
            self.observations[start..start + self.obs_dim].copy_from_slice(row);
        }
        Ok(())
    }

    /// Stores one agent's sampled actions, log-probabilities and values at `t`.
    pub fn record_policy(&mut self, t: usize, agent: usize, step: &PolicyStep) -> Result<()> {
        step.check_len(self.num_envs)?;
        for env in 0..self.num_envs {
            let slot = self.slot(t, env, agent);
            self.actions[slot] = step.actions[env];
            self.log_probs[slot] = step.log_probs[env];
            self.values[slot] = step.values[env];
        }
        Ok(())
    }

    /// Stores the done flags observed before acting at `t`.
    pub fn record_dones(&mut self, t: usize, dones: &[bool]) -> Result<()> {
        Self::expect_len("done flags", self.num_envs, dones.len())?;
        let start = t * self.num_envs;
        self.dones[start..start + self.num_envs].copy_from_slice(dones);
        Ok(())
    }

    /// Stores the shared rewards received for acting at `t` and marks `t` filled.
    pub fn record_rewards(&mut self, t: usize, rewards: &[f32]) -> Result<()> {
        Self::expect_len("rewards", self.num_envs, rewards.len())?;
        let start = t * self.num_envs;
        self.rewards[start..start + self.num_envs].copy_from_slice(rewards);
        self.filled = t + 1;
        Ok(())
    }

    /// Shared rewards of the filled prefix, `[T', E]`.
    pub fn rewards(&self) -> &[f32] {
        &self.rewards[..self.filled * self.num_envs]
    }

    /// Done flags of the filled prefix, `[T', E]`.
    pub fn dones(&self) -> &[bool] {
        &self.dones[..self.filled * self.num_envs]
    }

    /// One agent's value estimates over the filled prefix, `[T', E]`.
    pub fn agent_values(&self, agent: usize) -> Vec<f32> {
        self.agent_column(agent, &self.values)
    }

    fn agent_column<T: Copy>(&self, agent: usize, field: &[T]) -> Vec<T> {
        let n = self.filled * self.num_envs;
        (0..n).map(|i| field[i * self.num_agents + agent]).collect()
    }

    /// Flattens one agent's transitions into a training batch.
    ///
    /// `advantages` and `returns` must cover the filled prefix, time-major.
    pub fn agent_batch(&self, agent: usize, advantages: Vec<f32>, returns: Vec<f32>) -> Result<AgentBatch> {
        let n = self.filled * self.num_envs;
        Self::expect_len("advantages", n, advantages.len())?;
        Self::expect_len("returns", n, returns.len())?;

        let mut observations = Vec::with_capacity(n * self.obs_dim);
        for i in 0..n {
            let start = (i * self.num_agents + agent) * self.obs_dim;
            observations.extend_from_slice(&self.observations[start..start + self.obs_dim]);
        }

        Ok(AgentBatch {
            obs_dim: self.obs_dim,
            observations,
            actions: self.agent_column(agent, &self.actions),
            log_probs: self.agent_column(agent, &self.log_probs),
            values: self.agent_values(agent),
            advantages,
            returns,
        })
    }
}
