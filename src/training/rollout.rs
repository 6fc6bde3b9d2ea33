//! Rollout collection across parallel environments and agents.

use tracing::{debug, info};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::buffer::TrajectoryBuffer;
use crate::agents::{AgentMap, AgentRoster};
use crate::env::{EpisodeStats, VecMultiAgentEnv};
use crate::error::{Result, TrainError};
use crate::metrics::{self, MetricSink};
use crate::policy::{check_actions, ActorCritic};

/// Environment state carried from one rollout to the next.
#[derive(Debug, Clone)]
pub struct RolloutState {
    /// Latest observation mapping, in roster order.
    pub next_obs: AgentMap<Vec<f32>>,
    /// Whether `next_obs` opened a new episode, one flag per env.
    pub next_dones: Vec<bool>,
    /// Environment steps taken so far, summed over envs.
    pub global_step: u64,
}

impl RolloutState {
    /// Resets `env` and checks its first observation against the roster.
    pub fn start<E: VecMultiAgentEnv + ?Sized>(env: &mut E, roster: &AgentRoster) -> Result<Self> {
        let next_obs = env.reset()?;
        roster.conform(&next_obs)?;
        Ok(Self {
            next_obs,
            next_dones: vec![false; env.num_envs()],
            global_step: 0,
        })
    }

    /// Observation rows of the agent at roster position `agent`.
    pub fn observations_of(&self, roster: &AgentRoster, agent: usize) -> Result<&[f32]> {
        let id = &roster.ids()[agent];
        self.next_obs
            .get(id)
            .map(Vec::as_slice)
            .ok_or_else(|| TrainError::Environment(format!("no observation for agent {id}")))
    }
}

/// Outcome of one call to [`collect_rollout`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RolloutReport {
    /// Timesteps written to the buffer.
    pub steps: usize,
    /// Episodes that finished, in the order they were reported.
    pub episodes: Vec<EpisodeStats>,
}

impl RolloutReport {
    /// Whether the rollout stopped before filling the buffer.
    pub fn terminated_early(&self, num_steps: usize) -> bool {
        self.steps < num_steps
    }
}

/// Fills `buffer` by stepping `env` with actions sampled from `policy`.
///
/// At every timestep each agent, in roster order, is run through the shared
/// policy on its own observation rows; the per-agent choices are merged into
/// one action map per environment and the environment is stepped once. The
/// observation mapping returned by the environment must keep the roster
/// order, otherwise collection fails with
/// [`TrainError::AgentOrderMismatch`].
///
/// Collection stops after the first step on which any episode ends: the
/// finished episodes are logged and the remaining timesteps are left unfilled.
///
/// Every sampled action must index into the environment's discrete action
/// space; an out-of-range action fails with [`TrainError::BatchSizeMismatch`]
/// before the environment is stepped.
pub fn collect_rollout<E, P, S>(
    env: &mut E,
    policy: &P,
    roster: &AgentRoster,
    buffer: &mut TrajectoryBuffer,
    state: &mut RolloutState,
    sink: &mut S,
) -> Result<RolloutReport>
where
    E: VecMultiAgentEnv + ?Sized,
    P: ActorCritic + ?Sized,
    S: MetricSink + ?Sized,
{
    let num_envs = buffer.num_envs();
    if env.num_envs() != num_envs {
        return Err(TrainError::BatchSizeMismatch {
            what: "environment batch",
            expected: num_envs,
            actual: env.num_envs(),
        });
    }
    if roster.len() != buffer.num_agents() {
        return Err(TrainError::BatchSizeMismatch {
            what: "agent axis",
            expected: buffer.num_agents(),
            actual: roster.len(),
        });
    }

    let num_actions = env.single_action_space().require_discrete()?;

    buffer.clear();
    let mut episodes = Vec::new();

    for t in 0..buffer.num_steps() {
        state.global_step += num_envs as u64;
        buffer.record_dones(t, &state.next_dones)?;

        let mut action_maps: Vec<AgentMap<i64>> =
            (0..num_envs).map(|_| AgentMap::with_capacity(roster.len())).collect();

        for (i, agent) in roster.iter().enumerate() {
            let obs = state.observations_of(roster, i)?;
            buffer.record_observations(t, i, obs)?;

            let step = policy.act(obs, num_envs)?;
            check_actions(&step.actions, num_actions)?;
            buffer.record_policy(t, i, &step)?;
            for (map, action) in action_maps.iter_mut().zip(&step.actions) {
                map.insert(agent.clone(), *action);
            }
        }

        let result = env.step(&action_maps)?;
        roster.conform(&result.observations)?;
        if result.dones.len() != num_envs {
            return Err(TrainError::BatchSizeMismatch {
                what: "done flags",
                expected: num_envs,
                actual: result.dones.len(),
            });
        }
        buffer.record_rewards(t, &result.rewards)?;
        state.next_obs = result.observations;
        state.next_dones = result.dones;

        let finished = state.next_dones.iter().filter(|d| **d).count();
        if !result.episodes.is_empty() && result.episodes.len() != finished {
            return Err(TrainError::EpisodeCountMismatch {
                episodes: result.episodes.len(),
                dones: finished,
            });
        }

        for episode in &result.episodes {
            info!(
                global_step = state.global_step,
                env = episode.env_index,
                episodic_return = episode.episode_return,
                episodic_length = episode.length,
                "episode finished"
            );
            sink.record(metrics::EPISODIC_RETURN, episode.episode_return, state.global_step);
            sink.record(metrics::EPISODIC_LENGTH, episode.length as f64, state.global_step);
        }
        episodes.extend(result.episodes);

        if finished > 0 {
            debug!(step = t, "episode boundary reached, ending rollout early");
            break;
        }
    }

    Ok(RolloutReport {
        steps: buffer.filled(),
        episodes,
    })
}
