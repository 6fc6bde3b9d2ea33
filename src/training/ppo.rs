//! PPO epoch/minibatch loop and its diagnostics.
//!
//! The loop is independent of the tensor backend: a [`MinibatchStep`]
//! re-evaluates the policy on a minibatch, reports the diagnostics, and
//! applies the gradient step when asked to. The loop decides whether to apply
//! it, so an early stop on KL never takes the offending step.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::warn;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::PpoConfig;
use crate::error::Result;

/// Epsilon added to the advantage standard deviation.
pub const ADV_NORM_EPS: f32 = 1e-8;

/// Diagnostics of one minibatch evaluation, before its gradient step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MinibatchReport {
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    pub old_approx_kl: f64,
    pub approx_kl: f64,
    pub clip_fraction: f64,
}

impl MinibatchReport {
    /// Fills the ratio-derived fields from `log(π_new / π_old)` per sample.
    pub fn with_log_ratios(mut self, log_ratios: &[f64], clip_coef: f64) -> Self {
        self.old_approx_kl = old_approx_kl(log_ratios);
        self.approx_kl = approx_kl(log_ratios);
        self.clip_fraction = clip_fraction(log_ratios, clip_coef);
        self
    }
}

/// One agent's optimization summary for an update.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OptimizeStats {
    /// Diagnostics of the last evaluated minibatch.
    pub last: MinibatchReport,
    /// Mean clip fraction over every evaluated minibatch.
    pub clip_fraction: f64,
    /// Gradient steps actually applied.
    pub gradient_steps: usize,
    /// Epochs run to completion.
    pub epochs_completed: usize,
    /// Whether the KL limit cut the epochs short.
    pub stopped_early: bool,
}

/// Backend hook for one PPO minibatch.
pub trait MinibatchStep {
    /// Whatever the backend needs to apply the step later, e.g. a loss tensor.
    type Pending;

    /// Re-evaluates the policy on the batch rows in `indices`.
    fn evaluate(&mut self, indices: &[usize]) -> Result<(Self::Pending, MinibatchReport)>;

    /// Backpropagates, clips gradients and steps the optimizer.
    fn apply(&mut self, pending: Self::Pending) -> Result<()>;
}

/// Runs `update_epochs` shuffled passes over a batch of `len` samples.
///
/// Each minibatch is evaluated first; if `target_kl` is set and the
/// minibatch's approximate KL exceeds it, the agent's remaining epochs are
/// skipped without applying that step.
pub fn run_epochs<S>(step: &mut S, len: usize, config: &PpoConfig, rng: &mut StdRng) -> Result<OptimizeStats>
where
    S: MinibatchStep + ?Sized,
{
    let mut stats = OptimizeStats::default();
    if len == 0 {
        return Ok(stats);
    }

    let minibatch_size = config.minibatch_size().max(1);
    let mut indices: Vec<usize> = (0..len).collect();
    let mut clip_fractions = Vec::new();

    'epochs: for epoch in 0..config.update_epochs {
        indices.shuffle(rng);
        for minibatch in indices.chunks(minibatch_size) {
            let (pending, report) = step.evaluate(minibatch)?;
            clip_fractions.push(report.clip_fraction);
            stats.last = report;

            if let Some(target_kl) = config.target_kl {
                if report.approx_kl > target_kl {
                    warn!(
                        epoch,
                        approx_kl = report.approx_kl,
                        target_kl,
                        "approximate KL above target, stopping early"
                    );
                    stats.stopped_early = true;
                    break 'epochs;
                }
            }

            step.apply(pending)?;
            stats.gradient_steps += 1;
        }
        stats.epochs_completed += 1;
    }

    stats.clip_fraction = mean(&clip_fractions);
    Ok(stats)
}

/// Normalizes advantages in place to zero mean and unit (sample) std.
pub fn normalize_advantages(advantages: &mut [f32]) {
    if advantages.is_empty() {
        return;
    }
    let n = advantages.len() as f64;
    let mean = advantages.iter().map(|a| f64::from(*a)).sum::<f64>() / n;
    let std = if advantages.len() > 1 {
        let var = advantages
            .iter()
            .map(|a| (f64::from(*a) - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        var.sqrt()
    } else {
        0.0
    };
    let denom = std + f64::from(ADV_NORM_EPS);
    for a in advantages.iter_mut() {
        *a = ((f64::from(*a) - mean) / denom) as f32;
    }
}

/// `E[-log r]`, the naive KL estimate.
pub fn old_approx_kl(log_ratios: &[f64]) -> f64 {
    mean_by(log_ratios, |lr| -lr)
}

/// `E[(r - 1) - log r]`, the low-variance unbiased KL estimate.
pub fn approx_kl(log_ratios: &[f64]) -> f64 {
    mean_by(log_ratios, |lr| lr.exp_m1() - lr)
}

/// Fraction of samples whose ratio left `[1 - clip, 1 + clip]`.
pub fn clip_fraction(log_ratios: &[f64], clip_coef: f64) -> f64 {
    mean_by(log_ratios, |lr| {
        if lr.exp_m1().abs() > clip_coef {
            1.0
        } else {
            0.0
        }
    })
}

/// `1 - Var[target - predicted] / Var[target]`, or NaN when the target is constant.
pub fn explained_variance(predicted: &[f32], target: &[f32]) -> f64 {
    let var_target = variance(target.iter().map(|y| f64::from(*y)));
    if var_target == 0.0 || var_target.is_nan() {
        return f64::NAN;
    }
    let residual = variance(
        target
            .iter()
            .zip(predicted)
            .map(|(y, p)| f64::from(*y) - f64::from(*p)),
    );
    1.0 - residual / var_target
}

fn variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n == 0 {
        return f64::NAN;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}

fn mean_by(values: &[f64], f: impl Fn(f64) -> f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| f(*v)).sum::<f64>() / values.len() as f64
}

fn mean(values: &[f64]) -> f64 {
    mean_by(values, |v| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Fake learner whose policy drifts by `drift` in log-ratio per applied step.
    struct Drifting {
        drift: f64,
        applied: usize,
        evaluated: Vec<usize>,
    }

    impl MinibatchStep for Drifting {
        type Pending = ();

        fn evaluate(&mut self, indices: &[usize]) -> Result<((), MinibatchReport)> {
            self.evaluated.push(indices.len());
            let log_ratios = vec![self.drift * self.applied as f64; indices.len()];
            Ok(((), MinibatchReport::default().with_log_ratios(&log_ratios, 0.2)))
        }

        fn apply(&mut self, _: ()) -> Result<()> {
            self.applied += 1;
            Ok(())
        }
    }

    fn drifting(drift: f64) -> Drifting {
        Drifting {
            drift,
            applied: 0,
            evaluated: Vec::new(),
        }
    }

    fn config(target_kl: Option<f64>) -> PpoConfig {
        PpoConfig {
            num_envs: 2,
            num_steps: 8,
            num_minibatches: 4,
            update_epochs: 3,
            target_kl,
            ..PpoConfig::default()
        }
    }

    #[test]
    fn full_run_visits_every_minibatch() {
        let mut step = drifting(0.0);
        let mut rng = StdRng::seed_from_u64(0);
        let stats = run_epochs(&mut step, 16, &config(None), &mut rng).unwrap();
        assert_eq!(stats.gradient_steps, 12);
        assert_eq!(stats.epochs_completed, 3);
        assert!(!stats.stopped_early);
        assert!(step.evaluated.iter().all(|n| *n == 4));
    }

    #[test]
    fn zero_target_kl_allows_at_most_one_step() {
        let mut step = drifting(0.05);
        let mut rng = StdRng::seed_from_u64(0);
        let stats = run_epochs(&mut step, 16, &config(Some(0.0)), &mut rng).unwrap();
        assert!(stats.gradient_steps <= 1);
        assert_eq!(step.applied, stats.gradient_steps);
        assert!(stats.stopped_early);
        assert_eq!(stats.epochs_completed, 0);
    }

    #[test]
    fn loose_target_kl_stops_later() {
        let mut step = drifting(0.05);
        let mut rng = StdRng::seed_from_u64(0);
        // approx_kl after k steps is exp(0.05k) - 1 - 0.05k; it first exceeds
        // 0.01 at k = 3.
        let stats = run_epochs(&mut step, 16, &config(Some(0.01)), &mut rng).unwrap();
        assert_eq!(stats.gradient_steps, 3);
        assert!(stats.stopped_early);
    }

    #[test]
    fn partial_batch_yields_short_last_minibatch() {
        let mut step = drifting(0.0);
        let mut rng = StdRng::seed_from_u64(0);
        let stats = run_epochs(&mut step, 6, &config(None), &mut rng).unwrap();
        assert_eq!(stats.gradient_steps, 6);
        assert_eq!(&step.evaluated[..2], &[4, 2]);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut step = drifting(0.0);
        let mut rng = StdRng::seed_from_u64(0);
        let stats = run_epochs(&mut step, 0, &config(None), &mut rng).unwrap();
        assert_eq!(stats, OptimizeStats::default());
    }

    #[test]
    fn unit_ratio_has_zero_kl_and_no_clipping() {
        let lr = [0.0; 5];
        assert_eq!(approx_kl(&lr), 0.0);
        assert_eq!(old_approx_kl(&lr), 0.0);
        assert_eq!(clip_fraction(&lr, 0.2), 0.0);
    }

    #[test]
    fn clip_fraction_counts_ratios_outside_band() {
        let lr = [0.0, (1.5f64).ln(), (0.5f64).ln(), (1.1f64).ln()];
        assert!((clip_fraction(&lr, 0.2) - 0.5).abs() < 1e-12);
        assert!(approx_kl(&lr) > 0.0);
    }

    #[test]
    fn normalized_advantages_have_zero_mean_unit_std() {
        let mut adv = [1.0, 2.0, 3.0, 4.0];
        normalize_advantages(&mut adv);
        let mean: f32 = adv.iter().sum::<f32>() / 4.0;
        let var: f32 = adv.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / 3.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn constant_advantages_normalize_to_zero() {
        let mut adv = [2.5; 3];
        normalize_advantages(&mut adv);
        assert!(adv.iter().all(|a| *a == 0.0));
        let mut single = [7.0];
        normalize_advantages(&mut single);
        assert_eq!(single, [0.0]);
    }

    #[test]
    fn explained_variance_of_perfect_prediction_is_one() {
        let y = [1.0, 2.0, 4.0];
        assert!((explained_variance(&y, &y) - 1.0).abs() < 1e-12);
        assert!((explained_variance(&[0.0; 3], &y)).abs() < 1e-12);
    }

    #[test]
    fn explained_variance_of_constant_target_is_nan() {
        assert!(explained_variance(&[0.1, 0.2], &[1.0, 1.0]).is_nan());
        assert!(explained_variance(&[], &[]).is_nan());
    }
}
