//! Hyperparameters for decentralized PPO training.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Training hyperparameters.
///
/// Rollouts are `num_steps` long over `num_envs` parallel environments, so
/// one update consumes `num_envs * num_steps` transitions per agent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PpoConfig {
    // --- Run length ---
    /// Total environment steps across all parallel environments.
    pub total_timesteps: usize,
    /// Seed for minibatch shuffling and network initialization.
    pub seed: u64,

    // --- Rollout ---
    /// Number of parallel environment instances E.
    pub num_envs: usize,
    /// Rollout horizon T.
    pub num_steps: usize,

    // --- Optimizer ---
    /// Base learning rate.
    pub learning_rate: f64,
    /// Linearly anneal the learning rate to zero over all updates.
    pub anneal_lr: bool,
    /// Maximum global gradient norm.
    pub max_grad_norm: f64,

    // --- Returns ---
    /// Use GAE(λ); otherwise plain n-step bootstrapped returns.
    pub gae: bool,
    /// Discount factor γ.
    pub gamma: f64,
    /// GAE λ parameter.
    pub gae_lambda: f64,

    // --- PPO update ---
    /// Number of minibatches each agent batch is split into.
    pub num_minibatches: usize,
    /// Passes over each agent batch per update.
    pub update_epochs: usize,
    /// Normalize advantages per minibatch.
    pub norm_adv: bool,
    /// Surrogate clipping coefficient ε.
    pub clip_coef: f64,
    /// Clip the value loss with the same ε.
    pub clip_vloss: bool,
    /// Entropy bonus coefficient.
    pub ent_coef: f64,
    /// Value loss coefficient.
    pub vf_coef: f64,
    /// Stop an agent's epochs once approximate KL exceeds this.
    pub target_kl: Option<f64>,
}

impl PpoConfig {
    /// Transitions per agent in one full rollout.
    pub fn batch_size(&self) -> usize {
        self.num_envs * self.num_steps
    }

    /// Minibatch size used when slicing an agent batch.
    pub fn minibatch_size(&self) -> usize {
        self.batch_size() / self.num_minibatches.max(1)
    }

    /// Number of collect/optimize rounds in a full run.
    pub fn num_updates(&self) -> usize {
        match self.batch_size() {
            0 => 0,
            b => self.total_timesteps / b,
        }
    }

    /// Checks that the configuration describes a runnable job.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TrainError::InvalidConfig(msg));

        if self.num_envs == 0 || self.num_steps == 0 {
            return fail("num_envs and num_steps must be positive".into());
        }
        if self.num_minibatches == 0 || self.batch_size() % self.num_minibatches != 0 {
            return fail(format!(
                "batch size {} is not divisible into {} minibatches",
                self.batch_size(),
                self.num_minibatches
            ));
        }
        if self.update_epochs == 0 {
            return fail("update_epochs must be positive".into());
        }
        if self.num_updates() == 0 {
            return fail(format!(
                "total_timesteps {} is smaller than one batch of {}",
                self.total_timesteps,
                self.batch_size()
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) || !(0.0..=1.0).contains(&self.gae_lambda) {
            return fail("gamma and gae_lambda must lie in [0, 1]".into());
        }
        if !(self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        for (name, v) in [
            ("clip_coef", self.clip_coef),
            ("ent_coef", self.ent_coef),
            ("vf_coef", self.vf_coef),
            ("max_grad_norm", self.max_grad_norm),
        ] {
            if !(v >= 0.0) {
                return fail(format!("{name} must be non-negative, got {v}"));
            }
        }
        if let Some(kl) = self.target_kl {
            if !(kl >= 0.0) {
                return fail(format!("target_kl must be non-negative, got {kl}"));
            }
        }
        Ok(())
    }

    /// Rows of `(name, value)` for the hyperparameter table logged at start.
    pub fn table(&self) -> Vec<(&'static str, String)> {
        vec![
            ("total_timesteps", self.total_timesteps.to_string()),
            ("seed", self.seed.to_string()),
            ("num_envs", self.num_envs.to_string()),
            ("num_steps", self.num_steps.to_string()),
            ("learning_rate", self.learning_rate.to_string()),
            ("anneal_lr", self.anneal_lr.to_string()),
            ("max_grad_norm", self.max_grad_norm.to_string()),
            ("gae", self.gae.to_string()),
            ("gamma", self.gamma.to_string()),
            ("gae_lambda", self.gae_lambda.to_string()),
            ("num_minibatches", self.num_minibatches.to_string()),
            ("update_epochs", self.update_epochs.to_string()),
            ("norm_adv", self.norm_adv.to_string()),
            ("clip_coef", self.clip_coef.to_string()),
            ("clip_vloss", self.clip_vloss.to_string()),
            ("ent_coef", self.ent_coef.to_string()),
            ("vf_coef", self.vf_coef.to_string()),
            ("target_kl", format!("{:?}", self.target_kl)),
        ]
    }
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            total_timesteps: 500_000,
            seed: 1,
            num_envs: 4,
            num_steps: 128,
            learning_rate: 2.5e-4,
            anneal_lr: true,
            max_grad_norm: 0.5,
            gae: true,
            gamma: 0.99,
            gae_lambda: 0.95,
            num_minibatches: 4,
            update_epochs: 4,
            norm_adv: true,
            clip_coef: 0.2,
            clip_vloss: true,
            ent_coef: 0.01,
            vf_coef: 0.5,
            target_kl: None,
        }
    }
}
