//! Training infrastructure for decentralized multi-agent PPO.
//!
//! Provides the trajectory buffer, return estimation, the rollout collector,
//! the PPO epoch loop and the trainer that drives them.

pub mod buffer;
pub mod gae;
#[cfg(feature = "nn")]
pub mod learner;
pub mod ppo;
pub mod rollout;
pub mod schedule;
pub mod trainer;

pub use buffer::{AgentBatch, TrajectoryBuffer};
pub use gae::{compute_advantages, Bootstrap, ReturnEstimator};
#[cfg(feature = "nn")]
pub use learner::TchLearner;
pub use ppo::{MinibatchReport, MinibatchStep, OptimizeStats};
pub use rollout::{collect_rollout, RolloutReport, RolloutState};
pub use trainer::{AgentUpdate, Learner, StopHandle, Trainer, TrainingSummary, UpdateReport};
