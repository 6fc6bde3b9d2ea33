//! Serial vectorization of single-instance environments.

use tracing::trace;

use super::{EpisodeStats, MultiAgentEnv, StepResult, VecMultiAgentEnv, VecStepResult};
use crate::agents::AgentMap;
use crate::error::{Result, TrainError};
use crate::spaces::{ActionSpace, ObservationSpace};

/// Episode horizon applied when none is given.
pub const DEFAULT_MAX_EPISODE_STEPS: usize = 200;

/// Steps a list of [`MultiAgentEnv`] instances one after the other.
///
/// # Lifecycle
///
/// 1. [`SyncVecEnv::new`] takes ownership of the instances.
/// 2. [`VecMultiAgentEnv::reset`] resets all of them.
/// 3. Each [`VecMultiAgentEnv::step`] steps every instance. An instance whose
///    episode ends (terminal state or time limit) is reset immediately, its
///    returned observation is the first of the new episode, and its episode
///    statistics are reported once.
#[derive(Debug)]
pub struct SyncVecEnv<E> {
    envs: Vec<E>,
    observation_space: ObservationSpace,
    action_space: ActionSpace,
    obs_dim: usize,
    max_episode_steps: Option<usize>,
    episode_returns: Vec<f64>,
    episode_lengths: Vec<usize>,
}

impl<E: MultiAgentEnv> SyncVecEnv<E> {
    /// Wraps `envs` with the default time limit.
    pub fn new(envs: Vec<E>) -> Result<Self> {
        Self::with_time_limit(envs, Some(DEFAULT_MAX_EPISODE_STEPS))
    }

    /// Wraps `envs`, truncating episodes after `max_episode_steps` steps.
    pub fn with_time_limit(envs: Vec<E>, max_episode_steps: Option<usize>) -> Result<Self> {
        let first = envs
            .first()
            .ok_or_else(|| TrainError::InvalidConfig("no environment instances".into()))?;
        let observation_space = first.observation_space().clone();
        let action_space = first.action_space().clone();
        let obs_dim = observation_space.flat_dim()?;
        if envs
            .iter()
            .any(|e| *e.observation_space() != observation_space || *e.action_space() != action_space)
        {
            return Err(TrainError::InvalidConfig(
                "environment instances disagree on their spaces".into(),
            ));
        }
        let n = envs.len();
        Ok(Self {
            envs,
            observation_space,
            action_space,
            obs_dim,
            max_episode_steps,
            episode_returns: vec![0.0; n],
            episode_lengths: vec![0; n],
        })
    }

    /// Borrow the wrapped instances.
    pub fn envs(&self) -> &[E] {
        &self.envs
    }

    /// Concatenates per-instance observations into env-major rows per agent,
    /// keyed in the order the first instance reports.
    fn stack(&self, per_env: Vec<AgentMap<Vec<f32>>>) -> Result<AgentMap<Vec<f32>>> {
        let Some(first) = per_env.first() else {
            return Ok(AgentMap::new());
        };
        let mut stacked = AgentMap::with_capacity(first.len());
        for agent in first.keys() {
            let mut rows = Vec::with_capacity(per_env.len() * self.obs_dim);
            for obs in &per_env {
                let row = obs.get(agent).ok_or_else(|| {
                    TrainError::Environment(format!("instance is missing agent {agent}"))
                })?;
                if row.len() != self.obs_dim {
                    return Err(TrainError::BatchSizeMismatch {
                        what: "observation row",
                        expected: self.obs_dim,
                        actual: row.len(),
                    });
                }
                rows.extend_from_slice(row);
            }
            stacked.insert(agent.clone(), rows);
        }
        Ok(stacked)
    }
}

impl<E: MultiAgentEnv> VecMultiAgentEnv for SyncVecEnv<E> {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn single_observation_space(&self) -> &ObservationSpace {
        &self.observation_space
    }

    fn single_action_space(&self) -> &ActionSpace {
        &self.action_space
    }

    fn reset(&mut self) -> Result<AgentMap<Vec<f32>>> {
        self.episode_returns.iter_mut().for_each(|r| *r = 0.0);
        self.episode_lengths.iter_mut().for_each(|l| *l = 0);
        let per_env = self
            .envs
            .iter_mut()
            .map(|e| e.reset())
            .collect::<Result<Vec<_>>>()?;
        self.stack(per_env)
    }

    fn step(&mut self, actions: &[AgentMap<i64>]) -> Result<VecStepResult> {
        if actions.len() != self.envs.len() {
            return Err(TrainError::BatchSizeMismatch {
                what: "action maps",
                expected: self.envs.len(),
                actual: actions.len(),
            });
        }

        let n = self.envs.len();
        let mut per_env = Vec::with_capacity(n);
        let mut rewards = Vec::with_capacity(n);
        let mut dones = Vec::with_capacity(n);
        let mut episodes = Vec::new();

        for (j, (env, action)) in self.envs.iter_mut().zip(actions).enumerate() {
            let StepResult {
                mut observations,
                reward,
                done,
            } = env.step(action)?;

            self.episode_returns[j] += f64::from(reward);
            self.episode_lengths[j] += 1;
            let truncated = self
                .max_episode_steps
                .is_some_and(|limit| self.episode_lengths[j] >= limit);

            if done || truncated {
                episodes.push(EpisodeStats {
                    env_index: j,
                    episode_return: self.episode_returns[j],
                    length: self.episode_lengths[j],
                });
                trace!(env = j, truncated, "episode finished, resetting");
                self.episode_returns[j] = 0.0;
                self.episode_lengths[j] = 0;
                observations = env.reset()?;
            }

            per_env.push(observations);
            rewards.push(reward);
            dones.push(done || truncated);
        }

        Ok(VecStepResult {
            observations: self.stack(per_env)?,
            rewards,
            dones,
            episodes,
        })
    }
}
