//! matt_ppo - decentralized multi-agent PPO for target tracking
//!
//! Trains one shared actor-critic for every agent of a cooperative
//! multi-target tracking simulation. Each agent acts on its own local
//! observation; the team shares a single reward per step. Rollouts are
//! collected from a batch of environments, advantages are estimated per
//! agent, and each agent's batch drives a clipped-surrogate update of the
//! shared parameters.
//!
//! The neural network lives behind the `nn` feature; everything else runs
//! against the [`policy::ActorCritic`] and [`training::Learner`] traits.

pub mod agents;
pub mod config;
pub mod env;
pub mod error;
pub mod metrics;
#[cfg(feature = "nn")]
pub mod network;
pub mod policy;
pub mod spaces;
pub mod training;

pub use agents::{AgentId, AgentMap, AgentRoster};
pub use config::PpoConfig;
pub use env::{MultiAgentEnv, SyncVecEnv, VecMultiAgentEnv};
pub use error::{Result, TrainError};
pub use metrics::{MemorySink, MetricSink, TracingSink};
#[cfg(feature = "nn")]
pub use network::PolicyValueNet;
pub use training::{Learner, StopHandle, Trainer, TrainingSummary, UpdateReport};
