//! Policy-value contract used during rollout collection.

use crate::error::{Result, TrainError};

/// Actions sampled for a batch of observations, with the quantities PPO
/// needs to store alongside them.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStep {
    /// Sampled discrete action per row.
    pub actions: Vec<i64>,
    /// Log-probability of each sampled action under the current policy.
    pub log_probs: Vec<f32>,
    /// Value estimate per row.
    pub values: Vec<f32>,
}

impl PolicyStep {
    /// Checks that every column holds exactly `batch` entries.
    pub fn check_len(&self, batch: usize) -> Result<()> {
        for (what, len) in [
            ("sampled actions", self.actions.len()),
            ("sampled log-probabilities", self.log_probs.len()),
            ("sampled values", self.values.len()),
        ] {
            if len != batch {
                return Err(TrainError::BatchSizeMismatch {
                    what,
                    expected: batch,
                    actual: len,
                });
            }
        }
        Ok(())
    }
}

/// A shared actor-critic queried without gradient tracking.
///
/// Observations arrive as `batch` rows of flattened `targets * features`
/// values. The same parameters serve every agent.
pub trait ActorCritic {
    /// Samples one action per row from the categorical policy.
    fn act(&self, observations: &[f32], batch: usize) -> Result<PolicyStep>;

    /// Value estimates used to bootstrap the end of a rollout.
    fn value(&self, observations: &[f32], batch: usize) -> Result<Vec<f32>>;

    /// Size of the categorical action head.
    fn num_actions(&self) -> usize;
}

/// Checks that every sampled action indexes into `0..num_actions`.
pub fn check_actions(actions: &[i64], num_actions: usize) -> Result<()> {
    for action in actions {
        let index = usize::try_from(*action).unwrap_or(usize::MAX);
        if index >= num_actions {
            return Err(TrainError::BatchSizeMismatch {
                what: "sampled action index",
                expected: num_actions,
                actual: index,
            });
        }
    }
    Ok(())
}

/// Splits a flat observation slice into `batch` rows, returning the row width.
pub fn row_width(observations: &[f32], batch: usize) -> Result<usize> {
    if batch == 0 || observations.len() % batch != 0 {
        return Err(TrainError::BatchSizeMismatch {
            what: "observation batch",
            expected: batch,
            actual: observations.len(),
        });
    }
    Ok(observations.len() / batch)
}
