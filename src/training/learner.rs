//! Tensor-backed PPO learner.
//!
//! Binds a [`PolicyValueNet`] to its Adam optimizer and implements the
//! clipped-surrogate update on top of [`run_epochs`].
//! This module is only available with the `nn` feature.

use rand::rngs::StdRng;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};

use super::buffer::AgentBatch;
use super::ppo::{normalize_advantages, run_epochs, MinibatchReport, MinibatchStep, OptimizeStats};
use super::trainer::Learner;
use crate::config::PpoConfig;
use crate::error::Result;
use crate::network::PolicyValueNet;
use crate::policy::{ActorCritic, PolicyStep};

/// Adam epsilon.
pub const ADAM_EPS: f64 = 1e-5;

/// A [`PolicyValueNet`] and the optimizer over its parameters.
pub struct TchLearner {
    net: PolicyValueNet,
    opt: nn::Optimizer,
    lr: f64,
}

impl TchLearner {
    /// Wraps an existing network.
    pub fn new(net: PolicyValueNet, learning_rate: f64) -> Result<Self> {
        let opt = nn::Adam {
            eps: ADAM_EPS,
            ..Default::default()
        }
        .build(net.var_store(), learning_rate)?;
        Ok(Self {
            net,
            opt,
            lr: learning_rate,
        })
    }

    /// Seeds libtorch from `config.seed` and builds a fresh network.
    pub fn from_config(
        obs_dim: usize,
        num_actions: usize,
        config: &PpoConfig,
        device: Device,
    ) -> Result<Self> {
        tch::manual_seed(config.seed as i64);
        Self::new(
            PolicyValueNet::new(obs_dim, num_actions, device),
            config.learning_rate,
        )
    }

    pub fn net(&self) -> &PolicyValueNet {
        &self.net
    }
}

impl ActorCritic for TchLearner {
    fn act(&self, observations: &[f32], batch: usize) -> Result<PolicyStep> {
        ActorCritic::act(&self.net, observations, batch)
    }

    fn value(&self, observations: &[f32], batch: usize) -> Result<Vec<f32>> {
        ActorCritic::value(&self.net, observations, batch)
    }

    fn num_actions(&self) -> usize {
        self.net.num_actions()
    }
}

impl Learner for TchLearner {
    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
        self.opt.set_lr(lr);
    }

    fn optimize(
        &mut self,
        batch: &AgentBatch,
        config: &PpoConfig,
        rng: &mut StdRng,
    ) -> Result<OptimizeStats> {
        if batch.is_empty() {
            return Ok(OptimizeStats::default());
        }
        let device = self.net.device();
        let mut step = TchMinibatch {
            observations: self.net.observations(&batch.observations, batch.len())?,
            actions: Tensor::from_slice(&batch.actions).to_device(device),
            log_probs: Tensor::from_slice(&batch.log_probs).to_device(device),
            values: Tensor::from_slice(&batch.values).to_device(device),
            returns: Tensor::from_slice(&batch.returns).to_device(device),
            advantages: &batch.advantages,
            net: &self.net,
            opt: &mut self.opt,
            config,
        };
        run_epochs(&mut step, batch.len(), config, rng)
    }
}

/// One agent's batch as tensors, plus what a gradient step needs.
struct TchMinibatch<'a> {
    observations: Tensor,
    actions: Tensor,
    log_probs: Tensor,
    values: Tensor,
    returns: Tensor,
    advantages: &'a [f32],
    net: &'a PolicyValueNet,
    opt: &'a mut nn::Optimizer,
    config: &'a PpoConfig,
}

impl MinibatchStep for TchMinibatch<'_> {
    type Pending = Tensor;

    fn evaluate(&mut self, indices: &[usize]) -> Result<(Tensor, MinibatchReport)> {
        let device = self.net.device();
        let index: Vec<i64> = indices.iter().map(|i| *i as i64).collect();
        let index = Tensor::from_slice(&index).to_device(device);

        let obs = self.observations.index_select(0, &index);
        let actions = self.actions.index_select(0, &index);
        let old_log_probs = self.log_probs.index_select(0, &index);
        let old_values = self.values.index_select(0, &index);
        let returns = self.returns.index_select(0, &index);

        let mut advantages: Vec<f32> = indices.iter().map(|i| self.advantages[*i]).collect();
        if self.config.norm_adv {
            normalize_advantages(&mut advantages);
        }
        let advantages = Tensor::from_slice(&advantages).to_device(device);

        let (new_log_probs, entropy, new_values) = self.net.evaluate(&obs, &actions);
        let log_ratio = &new_log_probs - &old_log_probs;
        let ratio = log_ratio.exp();

        let clip = self.config.clip_coef;
        let pg_loss1 = -&advantages * &ratio;
        let pg_loss2 = -&advantages * ratio.clamp(1.0 - clip, 1.0 + clip);
        let pg_loss = pg_loss1.max_other(&pg_loss2).mean(Kind::Float);

        let v_loss = value_loss(
            &new_values,
            &old_values,
            &returns,
            self.config.clip_vloss.then_some(clip),
        );
        let entropy_loss = entropy.mean(Kind::Float);
        let loss = &pg_loss - self.config.ent_coef * &entropy_loss + &v_loss * self.config.vf_coef;

        let log_ratios: Vec<f64> = Vec::<f32>::try_from(&log_ratio.detach().to_device(Device::Cpu))?
            .into_iter()
            .map(f64::from)
            .collect();
        let report = MinibatchReport {
            policy_loss: f64::try_from(&pg_loss)?,
            value_loss: f64::try_from(&v_loss)?,
            entropy: f64::try_from(&entropy_loss)?,
            ..MinibatchReport::default()
        }
        .with_log_ratios(&log_ratios, clip);

        Ok((loss, report))
    }

    fn apply(&mut self, loss: Tensor) -> Result<()> {
        self.opt.zero_grad();
        loss.backward();
        self.opt.clip_grad_norm(self.config.max_grad_norm);
        self.opt.step();
        Ok(())
    }
}

/// Half mean squared error of the value head.
///
/// With `clip`, the new prediction is also clipped to within `clip` of the
/// stored one and the larger of the two squared errors is taken per sample,
/// so the result is never below the unclipped loss.
pub fn value_loss(new: &Tensor, old: &Tensor, returns: &Tensor, clip: Option<f64>) -> Tensor {
    let unclipped = (new - returns).square();
    match clip {
        Some(c) => {
            let clipped = old + (new - old).clamp(-c, c);
            let clipped = (clipped - returns).square();
            0.5 * unclipped.max_other(&clipped).mean(Kind::Float)
        }
        None => 0.5 * unclipped.mean(Kind::Float),
    }
}
