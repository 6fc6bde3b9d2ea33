//! Scalar metric stream emitted during training.
//!
//! The trainer reports every scalar through a [`MetricSink`], keyed by name
//! and indexed by the global environment step. [`TracingSink`] forwards the
//! stream to `tracing`; [`MemorySink`] keeps it for inspection.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const EPISODIC_RETURN: &str = "charts/episodic_return";
pub const EPISODIC_LENGTH: &str = "charts/episodic_length";
pub const LEARNING_RATE: &str = "charts/learning_rate";
pub const SPS: &str = "charts/SPS";
pub const VALUE_LOSS: &str = "losses/value_loss";
pub const POLICY_LOSS: &str = "losses/policy_loss";
pub const ENTROPY: &str = "losses/entropy";
pub const OLD_APPROX_KL: &str = "losses/old_approx_kl";
pub const APPROX_KL: &str = "losses/approx_kl";
pub const CLIP_FRACTION: &str = "losses/clipfrac";
pub const EXPLAINED_VARIANCE: &str = "losses/explained_variance";

/// Destination for scalar training metrics.
pub trait MetricSink {
    /// Records `value` under `key` at environment step `step`.
    fn record(&mut self, key: &str, value: f64, step: u64);
}

/// Forwards every metric as a `tracing` event on the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&mut self, key: &str, value: f64, step: u64) {
        tracing::info!(target: "metrics", metric = key, value, step);
    }
}

/// One recorded scalar.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetricRecord {
    pub key: String,
    pub value: f64,
    pub step: u64,
}

/// Keeps every metric in memory, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<MetricRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values recorded under `key`, in order.
    pub fn values(&self, key: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.key == key)
            .map(|r| r.value)
            .collect()
    }

    /// Most recent value recorded under `key`.
    pub fn last(&self, key: &str) -> Option<f64> {
        self.records.iter().rev().find(|r| r.key == key).map(|r| r.value)
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, key: &str, value: f64, step: u64) {
        self.records.push(MetricRecord {
            key: key.to_string(),
            value,
            step,
        });
    }
}

impl<S: MetricSink + ?Sized> MetricSink for &mut S {
    fn record(&mut self, key: &str, value: f64, step: u64) {
        (**self).record(key, value, step);
    }
}

impl fmt::Display for MetricRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} = {:.6}", self.step, self.key, self.value)
    }
}
