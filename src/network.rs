//! Shared policy-value network using tch-rs (PyTorch bindings).
//!
//! One actor and one critic MLP, both reading an agent's flattened local
//! observation. Every agent is served by the same parameters.
//! This module is only available with the `nn` feature.

use tch::{nn, nn::Module, Device, Kind, Tensor};

use crate::error::{Result, TrainError};
use crate::policy::{row_width, ActorCritic, PolicyStep};

/// Hidden width of both MLPs.
pub const HIDDEN: i64 = 64;

/// Actor and critic MLPs held in a single [`nn::VarStore`].
///
/// Architecture: `obs_dim → 64 → 64 → {num_actions, 1}` with tanh
/// activations. Hidden layers use orthogonal init with gain √2, the policy
/// head gain 0.01 and the value head gain 1; biases start at zero.
pub struct PolicyValueNet {
    vs: nn::VarStore,
    actor: nn::Sequential,
    critic: nn::Sequential,
    obs_dim: usize,
    num_actions: usize,
}

fn layer(p: nn::Path, input: i64, output: i64, gain: f64) -> nn::Linear {
    nn::linear(
        p,
        input,
        output,
        nn::LinearConfig {
            ws_init: nn::Init::Orthogonal { gain },
            bs_init: Some(nn::Init::Const(0.0)),
            bias: true,
        },
    )
}

fn mlp(p: &nn::Path, input: i64, output: i64, head_gain: f64) -> nn::Sequential {
    let hidden_gain = std::f64::consts::SQRT_2;
    nn::seq()
        .add(layer(p / "l1", input, HIDDEN, hidden_gain))
        .add_fn(|x| x.tanh())
        .add(layer(p / "l2", HIDDEN, HIDDEN, hidden_gain))
        .add_fn(|x| x.tanh())
        .add(layer(p / "head", HIDDEN, output, head_gain))
}

impl PolicyValueNet {
    /// Creates a freshly initialized network.
    pub fn new(obs_dim: usize, num_actions: usize, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let actor = mlp(&(&root / "actor"), obs_dim as i64, num_actions as i64, 0.01);
        let critic = mlp(&(&root / "critic"), obs_dim as i64, 1, 1.0);
        Self {
            vs,
            actor,
            critic,
            obs_dim,
            num_actions,
        }
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Log-probabilities over actions, shape `[batch, num_actions]`.
    pub fn log_probs(&self, obs: &Tensor) -> Tensor {
        self.actor.forward(obs).log_softmax(-1, Kind::Float)
    }

    /// State values, shape `[batch]`.
    pub fn value(&self, obs: &Tensor) -> Tensor {
        self.critic.forward(obs).squeeze_dim(-1)
    }

    /// Samples actions without tracking gradients.
    ///
    /// Returns `(actions, log_probs, values)`.
    pub fn act(&self, obs: &Tensor) -> (Tensor, Tensor, Tensor) {
        tch::no_grad(|| {
            let log_probs = self.log_probs(obs);
            let actions = log_probs.exp().multinomial(1, true).squeeze_dim(-1);
            let selected = log_probs
                .gather(-1, &actions.unsqueeze(-1), false)
                .squeeze_dim(-1);
            (actions, selected, self.value(obs))
        })
    }

    /// Re-evaluates stored actions with gradients.
    ///
    /// Returns `(log_probs, entropy, values)`, each of shape `[batch]`.
    pub fn evaluate(&self, obs: &Tensor, actions: &Tensor) -> (Tensor, Tensor, Tensor) {
        let log_probs = self.log_probs(obs);
        let selected = log_probs
            .gather(-1, &actions.unsqueeze(-1), false)
            .squeeze_dim(-1);
        let entropy = -(log_probs.exp() * &log_probs).sum_dim_intlist([-1].as_slice(), false, Kind::Float);
        (selected, entropy, self.value(obs))
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Builds a `[batch, obs_dim]` tensor on the network's device.
    pub fn observations(&self, observations: &[f32], batch: usize) -> Result<Tensor> {
        let width = row_width(observations, batch)?;
        if width != self.obs_dim {
            return Err(TrainError::BatchSizeMismatch {
                what: "observation width",
                expected: self.obs_dim,
                actual: width,
            });
        }
        Ok(Tensor::from_slice(observations)
            .reshape([batch as i64, width as i64])
            .to_device(self.device()))
    }
}

impl ActorCritic for PolicyValueNet {
    fn act(&self, observations: &[f32], batch: usize) -> Result<PolicyStep> {
        let obs = self.observations(observations, batch)?;
        let (actions, log_probs, values) = PolicyValueNet::act(self, &obs);
        let step = PolicyStep {
            actions: Vec::<i64>::try_from(&actions.to_device(Device::Cpu))?,
            log_probs: Vec::<f32>::try_from(&log_probs.to_device(Device::Cpu))?,
            values: Vec::<f32>::try_from(&values.to_device(Device::Cpu))?,
        };
        step.check_len(batch)?;
        Ok(step)
    }

    fn value(&self, observations: &[f32], batch: usize) -> Result<Vec<f32>> {
        let obs = self.observations(observations, batch)?;
        let values = tch::no_grad(|| PolicyValueNet::value(self, &obs));
        Ok(Vec::<f32>::try_from(&values.to_device(Device::Cpu))?)
    }

    fn num_actions(&self) -> usize {
        self.num_actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_shapes() {
        let net = PolicyValueNet::new(6, 5, Device::Cpu);
        let obs = Tensor::randn([4, 6], (Kind::Float, Device::Cpu));
        assert_eq!(net.log_probs(&obs).size(), &[4, 5]);
        assert_eq!(net.value(&obs).size(), &[4]);
    }

    #[test]
    fn sampled_actions_are_in_range() {
        let net = PolicyValueNet::new(3, 4, Device::Cpu);
        let obs = vec![0.25f32; 3 * 7];
        let step = ActorCritic::act(&net, &obs, 7).unwrap();
        assert_eq!(step.actions.len(), 7);
        assert!(step.actions.iter().all(|a| (0..4).contains(a)));
        assert!(step.log_probs.iter().all(|lp| *lp <= 0.0));
    }

    #[test]
    fn stored_log_probs_reproduce_under_same_parameters() {
        let net = PolicyValueNet::new(3, 4, Device::Cpu);
        let obs = Tensor::randn([8, 3], (Kind::Float, Device::Cpu));
        let (actions, old_log_probs, old_values) = net.act(&obs);
        let (new_log_probs, entropy, new_values) = net.evaluate(&obs, &actions);
        let ratio = (new_log_probs - old_log_probs).exp();
        assert!(ratio.allclose(&Tensor::ones([8], (Kind::Float, Device::Cpu)), 1e-6, 1e-6, false));
        assert!(new_values.allclose(&old_values, 1e-6, 1e-6, false));
        assert!(entropy.min().double_value(&[]) > 0.0);
    }

    #[test]
    fn wrong_observation_width_is_rejected() {
        let net = PolicyValueNet::new(3, 4, Device::Cpu);
        let result = ActorCritic::value(&net, &[0.0; 8], 2);
        assert!(matches!(
            result,
            Err(TrainError::BatchSizeMismatch {
                what: "observation width",
                expected: 3,
                actual: 4
            })
        ));
    }
}
