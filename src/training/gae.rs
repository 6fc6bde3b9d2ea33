//! Advantage and return estimation (GAE-λ or n-step).
//!
//! Inputs are one agent's rollout laid out `[T, E]` time-major. Rewards and
//! done flags are the shared per-environment signals; values are the agent's
//! own estimates. Each agent therefore gets its own advantage series from the
//! same reward stream.
//!
//! `dones[t]` flags that the observation at `t` opened a new episode, so the
//! transition at `t` is cut off from `t + 1` when `dones[t + 1]` is set, and
//! from the bootstrap value when `next_dones` is set.

use crate::error::{Result, TrainError};

/// How returns are estimated from a rollout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnEstimator {
    /// Generalized advantage estimation; returns are `advantages + values`.
    Gae { gamma: f64, lambda: f64 },
    /// Bootstrapped discounted returns; advantages are `returns - values`.
    NStep { gamma: f64 },
}

/// Per-environment state right after the last collected step.
#[derive(Debug, Clone, Copy)]
pub struct Bootstrap<'a> {
    /// Value estimate of the observation following the rollout, one per env.
    pub next_values: &'a [f32],
    /// Whether that observation starts a new episode, one per env.
    pub next_dones: &'a [bool],
}

/// Computes `(advantages, returns)` for one agent.
///
/// # Arguments
///
/// * `rewards` - Shared rewards, `[T, E]`
/// * `dones` - Episode-start flags, `[T, E]`
/// * `values` - The agent's value estimates, `[T, E]`
/// * `bootstrap` - Next values and done flags, `[E]`
/// * `estimator` - GAE or n-step
pub fn compute_advantages(
    rewards: &[f32],
    dones: &[bool],
    values: &[f32],
    bootstrap: Bootstrap<'_>,
    estimator: ReturnEstimator,
) -> Result<(Vec<f32>, Vec<f32>)> {
    let num_envs = bootstrap.next_values.len();
    check_len("next done flags", num_envs, bootstrap.next_dones.len())?;
    check_len("done flags", rewards.len(), dones.len())?;
    check_len("values", rewards.len(), values.len())?;
    if num_envs == 0 || rewards.len() % num_envs != 0 {
        return Err(TrainError::BatchSizeMismatch {
            what: "rollout rows",
            expected: num_envs,
            actual: rewards.len(),
        });
    }
    let num_steps = rewards.len() / num_envs;

    let mut advantages = vec![0.0f32; rewards.len()];
    let mut returns = vec![0.0f32; rewards.len()];

    for env in 0..num_envs {
        let at = |t: usize| t * num_envs + env;
        let mut running = 0.0f64;
        let mut next_return = f64::from(bootstrap.next_values[env]);

        for t in (0..num_steps).rev() {
            let (next_non_terminal, next_value) = if t + 1 == num_steps {
                (
                    non_terminal(bootstrap.next_dones[env]),
                    f64::from(bootstrap.next_values[env]),
                )
            } else {
                (non_terminal(dones[at(t + 1)]), f64::from(values[at(t + 1)]))
            };
            let reward = f64::from(rewards[at(t)]);
            let value = f64::from(values[at(t)]);

            match estimator {
                ReturnEstimator::Gae { gamma, lambda } => {
                    let delta = reward + gamma * next_value * next_non_terminal - value;
                    running = delta + gamma * lambda * next_non_terminal * running;
                    advantages[at(t)] = running as f32;
                    returns[at(t)] = (running + value) as f32;
                }
                ReturnEstimator::NStep { gamma } => {
                    next_return = reward + gamma * next_non_terminal * next_return;
                    returns[at(t)] = next_return as f32;
                    advantages[at(t)] = (next_return - value) as f32;
                }
            }
        }
    }

    Ok((advantages, returns))
}

fn non_terminal(done: bool) -> f64 {
    if done {
        0.0
    } else {
        1.0
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
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
