use thiserror::Error;

/// Errors raised while setting up or running a training job.
///
/// None of these are retried: a malformed configuration or a collaborator
/// that breaks its contract invalidates the whole run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Only discrete action spaces are supported, got a continuous space of shape {0:?}")]
    UnsupportedActionSpace(Vec<usize>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Observation space declares no agents")]
    EmptyAgentSet,

    #[error("Agent {agent} has observation shape {actual:?}, expected {expected:?}")]
    ObservationShapeMismatch {
        agent: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Agent order diverged from the roster: expected {expected:?}, got {actual:?}")]
    AgentOrderMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Size mismatch for {what}: expected {expected}, got {actual}")]
    BatchSizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{episodes} episode records reported but {dones} done flags set")]
    EpisodeCountMismatch { episodes: usize, dones: usize },

    #[error("Environment error: {0}")]
    Environment(String),

    #[cfg(feature = "nn")]
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, TrainError>;
