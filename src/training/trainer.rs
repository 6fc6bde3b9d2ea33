//! Decentralized PPO driver.
//!
//! One shared actor-critic acts for every agent. Each update collects a
//! rollout, then for every agent in roster order bootstraps that agent's
//! value, estimates its advantages from the shared reward, and runs the PPO
//! epochs on its own flattened batch. Agents are optimized one after the
//! other, so later agents bootstrap with parameters already updated by
//! earlier ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::buffer::{AgentBatch, TrajectoryBuffer};
use super::gae::{compute_advantages, Bootstrap, ReturnEstimator};
use super::ppo::{explained_variance, OptimizeStats};
use super::rollout::{collect_rollout, RolloutReport, RolloutState};
use super::schedule::linear_anneal;
use crate::agents::{AgentId, AgentRoster};
use crate::config::PpoConfig;
use crate::env::VecMultiAgentEnv;
use crate::error::{Result, TrainError};
use crate::metrics::{self, MetricSink};
use crate::policy::ActorCritic;

/// The trainable side of the shared actor-critic.
///
/// Owns the network parameters and the optimizer. Parameters only change
/// inside [`Learner::optimize`].
pub trait Learner: ActorCritic {
    /// Rate the optimizer currently applies; reported as `charts/learning_rate`.
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Runs the PPO epochs for one agent's batch.
    fn optimize(
        &mut self,
        batch: &AgentBatch,
        config: &PpoConfig,
        rng: &mut StdRng,
    ) -> Result<OptimizeStats>;
}

/// Cloneable flag that ends [`Trainer::run`] before the next update.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of optimizing one agent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentUpdate {
    pub agent: AgentId,
    pub stats: OptimizeStats,
    /// NaN when the agent's returns were constant.
    pub explained_variance: f64,
}

/// Result of one collect → estimate → optimize round.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UpdateReport {
    /// 1-based update index.
    pub update: usize,
    pub global_step: u64,
    pub learning_rate: f64,
    pub rollout: RolloutReport,
    /// One entry per agent, in roster order.
    pub agents: Vec<AgentUpdate>,
    pub steps_per_second: f64,
}

/// Totals for a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainingSummary {
    pub updates: usize,
    pub global_step: u64,
    pub episodes: usize,
    /// Whether a [`StopHandle`] ended the run.
    pub stopped: bool,
}

/// Training context: learner, trajectory buffer, agent roster and RNG.
pub struct Trainer<L> {
    learner: L,
    config: PpoConfig,
    roster: AgentRoster,
    buffer: TrajectoryBuffer,
    state: RolloutState,
    rng: StdRng,
    stop: StopHandle,
    started: Instant,
}

impl<L: Learner> Trainer<L> {
    /// Validates the setup against `env` and resets it.
    ///
    /// # Errors
    ///
    /// * [`TrainError::UnsupportedActionSpace`] for a continuous action space
    /// * [`TrainError::InvalidConfig`] for a bad config, an env whose
    ///   instance count differs from `config.num_envs`, or a learner whose
    ///   action head does not match the env's discrete action count
    /// * [`TrainError::ObservationShapeMismatch`] if agents disagree on shape
    pub fn new<E>(learner: L, config: PpoConfig, env: &mut E) -> Result<Self>
    where
        E: VecMultiAgentEnv + ?Sized,
    {
        config.validate()?;
        let num_actions = env.single_action_space().require_discrete()?;
        if learner.num_actions() != num_actions {
            return Err(TrainError::InvalidConfig(format!(
                "policy has {} actions, env declares {}",
                learner.num_actions(),
                num_actions
            )));
        }
        if env.num_envs() != config.num_envs {
            return Err(TrainError::InvalidConfig(format!(
                "config expects {} environments, env provides {}",
                config.num_envs,
                env.num_envs()
            )));
        }

        let space = env.single_observation_space();
        let obs_dim = space.flat_dim()?;
        let roster = AgentRoster::new(space.agents().cloned())?;

        for (name, value) in config.table() {
            debug!(param = name, value = %value, "hyperparameter");
        }
        info!(
            agents = roster.len(),
            num_envs = config.num_envs,
            obs_dim,
            num_updates = config.num_updates(),
            "starting decentralized PPO"
        );

        let buffer = TrajectoryBuffer::new(config.num_steps, config.num_envs, roster.len(), obs_dim);
        let state = RolloutState::start(env, &roster)?;

        Ok(Self {
            learner,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            roster,
            buffer,
            state,
            stop: StopHandle::default(),
            started: Instant::now(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn learner_mut(&mut self) -> &mut L {
        &mut self.learner
    }

    pub fn into_learner(self) -> L {
        self.learner
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub fn roster(&self) -> &AgentRoster {
        &self.roster
    }

    pub fn buffer(&self) -> &TrajectoryBuffer {
        &self.buffer
    }

    pub fn global_step(&self) -> u64 {
        self.state.global_step
    }

    /// Runs `num_updates` updates, or fewer if the stop handle fires.
    pub fn run<E, S>(&mut self, env: &mut E, sink: &mut S) -> Result<TrainingSummary>
    where
        E: VecMultiAgentEnv + ?Sized,
        S: MetricSink + ?Sized,
    {
        let num_updates = self.config.num_updates();
        let mut summary = TrainingSummary::default();

        for update in 1..=num_updates {
            if self.stop.is_stopped() {
                info!(update, "stop requested, ending training");
                summary.stopped = true;
                break;
            }
            let report = self.update(update, num_updates, env, sink)?;
            summary.updates += 1;
            summary.episodes += report.rollout.episodes.len();
        }

        summary.global_step = self.state.global_step;
        info!(
            updates = summary.updates,
            global_step = summary.global_step,
            episodes = summary.episodes,
            "training finished"
        );
        Ok(summary)
    }

    /// Runs update `update` (1-based) of `num_updates`.
    pub fn update<E, S>(
        &mut self,
        update: usize,
        num_updates: usize,
        env: &mut E,
        sink: &mut S,
    ) -> Result<UpdateReport>
    where
        E: VecMultiAgentEnv + ?Sized,
        S: MetricSink + ?Sized,
    {
        let scheduled = if self.config.anneal_lr {
            linear_anneal(self.config.learning_rate, update, num_updates)
        } else {
            self.config.learning_rate
        };
        self.learner.set_learning_rate(scheduled);
        let learning_rate = self.learner.learning_rate();

        let rollout = collect_rollout(
            env,
            &self.learner,
            &self.roster,
            &mut self.buffer,
            &mut self.state,
            sink,
        )?;

        let estimator = if self.config.gae {
            ReturnEstimator::Gae {
                gamma: self.config.gamma,
                lambda: self.config.gae_lambda,
            }
        } else {
            ReturnEstimator::NStep {
                gamma: self.config.gamma,
            }
        };

        let mut agents = Vec::with_capacity(self.roster.len());
        for (i, agent) in self.roster.iter().enumerate() {
            let next_obs = self.state.observations_of(&self.roster, i)?;
            let next_values = self.learner.value(next_obs, self.buffer.num_envs())?;
            let (advantages, returns) = compute_advantages(
                self.buffer.rewards(),
                self.buffer.dones(),
                &self.buffer.agent_values(i),
                Bootstrap {
                    next_values: &next_values,
                    next_dones: &self.state.next_dones,
                },
                estimator,
            )?;
            let batch = self.buffer.agent_batch(i, advantages, returns)?;

            let stats = self.learner.optimize(&batch, &self.config, &mut self.rng)?;
            let explained_variance = explained_variance(&batch.values, &batch.returns);
            debug!(
                agent = %agent,
                samples = batch.len(),
                gradient_steps = stats.gradient_steps,
                policy_loss = stats.last.policy_loss,
                value_loss = stats.last.value_loss,
                approx_kl = stats.last.approx_kl,
                explained_variance,
                "agent optimized"
            );
            agents.push(AgentUpdate {
                agent: agent.clone(),
                stats,
                explained_variance,
            });
        }

        let global_step = self.state.global_step;
        let elapsed = self.started.elapsed().as_secs_f64();
        let steps_per_second = if elapsed > 0.0 {
            global_step as f64 / elapsed
        } else {
            0.0
        };

        let report = UpdateReport {
            update,
            global_step,
            learning_rate,
            rollout,
            agents,
            steps_per_second,
        };
        Self::emit(&report, sink);
        Ok(report)
    }

    fn emit<S: MetricSink + ?Sized>(report: &UpdateReport, sink: &mut S) {
        let step = report.global_step;
        let mean_of = |f: fn(&AgentUpdate) -> f64| {
            let values: Vec<f64> = report.agents.iter().map(f).filter(|v| !v.is_nan()).collect();
            if values.is_empty() {
                f64::NAN
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        sink.record(metrics::LEARNING_RATE, report.learning_rate, step);
        sink.record(metrics::VALUE_LOSS, mean_of(|a| a.stats.last.value_loss), step);
        sink.record(metrics::POLICY_LOSS, mean_of(|a| a.stats.last.policy_loss), step);
        sink.record(metrics::ENTROPY, mean_of(|a| a.stats.last.entropy), step);
        sink.record(metrics::OLD_APPROX_KL, mean_of(|a| a.stats.last.old_approx_kl), step);
        sink.record(metrics::APPROX_KL, mean_of(|a| a.stats.last.approx_kl), step);
        sink.record(metrics::CLIP_FRACTION, mean_of(|a| a.stats.clip_fraction), step);
        sink.record(metrics::EXPLAINED_VARIANCE, mean_of(|a| a.explained_variance), step);
        sink.record(metrics::SPS, report.steps_per_second.floor(), step);

        info!(
            update = report.update,
            global_step = step,
            sps = report.steps_per_second as u64,
            learning_rate = report.learning_rate,
            "update complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentMap;
    use crate::env::{MultiAgentEnv, StepResult, SyncVecEnv, VecStepResult};
    use crate::metrics::MemorySink;
    use crate::policy::{row_width, PolicyStep};
    use crate::spaces::{ActionSpace, ObservationSpace};

    /// Zero-valued critic, always chooses `action`, records what it is given.
    #[derive(Default)]
    struct RecordingLearner {
        num_actions: usize,
        action: i64,
        lr: f64,
        lr_cap: Option<f64>,
        learning_rates: Vec<f64>,
        batches: Vec<AgentBatch>,
        stop_after: Option<(usize, StopHandle)>,
    }

    /// Sized for [`Silent`]'s five actions.
    fn recording() -> RecordingLearner {
        RecordingLearner {
            num_actions: 5,
            ..RecordingLearner::default()
        }
    }

    impl ActorCritic for RecordingLearner {
        fn act(&self, observations: &[f32], batch: usize) -> Result<PolicyStep> {
            row_width(observations, batch)?;
            Ok(PolicyStep {
                actions: vec![self.action; batch],
                log_probs: vec![(0.5f32).ln(); batch],
                values: vec![0.0; batch],
            })
        }

        fn value(&self, observations: &[f32], batch: usize) -> Result<Vec<f32>> {
            row_width(observations, batch)?;
            Ok(vec![0.0; batch])
        }

        fn num_actions(&self) -> usize {
            self.num_actions
        }
    }

    impl Learner for RecordingLearner {
        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = self.lr_cap.map_or(lr, |cap| lr.min(cap));
            self.learning_rates.push(lr);
        }

        fn optimize(
            &mut self,
            batch: &AgentBatch,
            _config: &PpoConfig,
            _rng: &mut StdRng,
        ) -> Result<OptimizeStats> {
            self.batches.push(batch.clone());
            if let Some((n, handle)) = &self.stop_after {
                if self.batches.len() >= *n {
                    handle.stop();
                }
            }
            Ok(OptimizeStats {
                gradient_steps: 1,
                ..OptimizeStats::default()
            })
        }
    }

    /// Deterministic tracking stand-in with a constant reward (zero unless
    /// set): two agents, one target, two features; never terminates on its own.
    struct Silent {
        space: ObservationSpace,
        actions: ActionSpace,
        reward: f32,
        t: usize,
        seen_actions: Vec<AgentMap<i64>>,
    }

    impl Silent {
        fn new(actions: ActionSpace) -> Self {
            Self {
                space: ObservationSpace::uniform(["agent-0", "agent-1"], &[1, 2]),
                actions,
                reward: 0.0,
                t: 0,
                seen_actions: Vec::new(),
            }
        }

        fn obs(&self) -> AgentMap<Vec<f32>> {
            [
                ("agent-0", vec![self.t as f32, 0.0]),
                ("agent-1", vec![self.t as f32, 1.0]),
            ]
            .into_iter()
            .collect()
        }
    }

    impl MultiAgentEnv for Silent {
        fn observation_space(&self) -> &ObservationSpace {
            &self.space
        }

        fn action_space(&self) -> &ActionSpace {
            &self.actions
        }

        fn reset(&mut self) -> Result<AgentMap<Vec<f32>>> {
            self.t = 0;
            Ok(self.obs())
        }

        fn step(&mut self, actions: &AgentMap<i64>) -> Result<StepResult> {
            self.seen_actions.push(actions.clone());
            self.t += 1;
            Ok(StepResult {
                observations: self.obs(),
                reward: self.reward,
                done: false,
            })
        }
    }

    fn silent_env(num_envs: usize) -> SyncVecEnv<Silent> {
        rewarding_env(num_envs, 0.0)
    }

    fn rewarding_env(num_envs: usize, reward: f32) -> SyncVecEnv<Silent> {
        let envs = (0..num_envs)
            .map(|_| Silent {
                reward,
                ..Silent::new(ActionSpace::Discrete { n: 5 })
            })
            .collect();
        SyncVecEnv::with_time_limit(envs, None).unwrap()
    }

    fn small_config() -> PpoConfig {
        PpoConfig {
            num_envs: 1,
            num_steps: 4,
            num_minibatches: 2,
            total_timesteps: 16,
            gamma: 0.99,
            gae_lambda: 0.95,
            ..PpoConfig::default()
        }
    }

    #[test]
    fn zero_reward_zero_value_rollout_has_zero_advantages() {
        let mut env = silent_env(1);
        let mut trainer =
            Trainer::new(recording(), small_config(), &mut env).unwrap();
        let mut sink = MemorySink::new();

        let report = trainer.update(1, 4, &mut env, &mut sink).unwrap();

        assert_eq!(report.rollout.steps, 4);
        assert_eq!(report.agents.len(), 2);
        let batches = &trainer.learner().batches;
        assert_eq!(batches.len(), 2);
        for batch in batches {
            assert_eq!(batch.len(), 4);
            assert!(batch.advantages.iter().all(|a| *a == 0.0));
            assert!(batch.returns.iter().all(|r| *r == 0.0));
        }
        // Constant zero returns: explained variance is undefined.
        assert!(report.agents[0].explained_variance.is_nan());
        assert!(sink.last(metrics::EXPLAINED_VARIANCE).unwrap().is_nan());
    }

    #[test]
    fn batches_follow_roster_order() {
        let mut env = silent_env(1);
        let mut trainer =
            Trainer::new(recording(), small_config(), &mut env).unwrap();
        trainer.update(1, 4, &mut env, &mut MemorySink::new()).unwrap();

        let batches = &trainer.learner().batches;
        // Second feature carries the agent index.
        assert!(batches[0].observations.chunks(2).all(|row| row[1] == 0.0));
        assert!(batches[1].observations.chunks(2).all(|row| row[1] == 1.0));
        assert_eq!(trainer.roster().ids(), &["agent-0", "agent-1"]);
    }

    #[test]
    fn run_anneals_learning_rate_over_all_updates() {
        let mut env = silent_env(1);
        let config = PpoConfig {
            learning_rate: 1e-3,
            ..small_config()
        };
        let mut trainer = Trainer::new(recording(), config, &mut env).unwrap();
        let mut sink = MemorySink::new();

        let summary = trainer.run(&mut env, &mut sink).unwrap();

        assert_eq!(summary.updates, 4);
        assert_eq!(summary.global_step, 16);
        assert!(!summary.stopped);
        let expected = [1e-3, 7.5e-4, 5e-4, 2.5e-4];
        for (lr, e) in trainer.learner().learning_rates.iter().zip(expected) {
            assert!((lr - e).abs() < 1e-12);
        }
        assert_eq!(sink.values(metrics::LEARNING_RATE).len(), 4);
        assert_eq!(sink.records.last().unwrap().step, 16);
    }

    #[test]
    fn constant_learning_rate_without_annealing() {
        let mut env = silent_env(1);
        let config = PpoConfig {
            anneal_lr: false,
            ..small_config()
        };
        let mut trainer = Trainer::new(recording(), config, &mut env).unwrap();
        trainer.run(&mut env, &mut MemorySink::new()).unwrap();
        assert!(trainer
            .learner()
            .learning_rates
            .iter()
            .all(|lr| *lr == PpoConfig::default().learning_rate));
    }

    #[test]
    fn stop_handle_ends_run_between_updates() {
        let mut env = silent_env(1);
        let mut trainer =
            Trainer::new(recording(), small_config(), &mut env).unwrap();
        let handle = trainer.stop_handle();
        // Two agents per update: stop once the second update has optimized both.
        trainer.learner_mut().stop_after = Some((4, handle));

        let summary = trainer.run(&mut env, &mut MemorySink::new()).unwrap();
        assert_eq!(summary.updates, 2);
        assert!(summary.stopped);
    }

    #[test]
    fn continuous_action_space_is_rejected_at_startup() {
        let envs = vec![Silent::new(ActionSpace::Continuous { shape: vec![2] })];
        let mut env = SyncVecEnv::new(envs).unwrap();
        let result = Trainer::new(recording(), small_config(), &mut env);
        assert!(matches!(result, Err(TrainError::UnsupportedActionSpace(_))));
    }

    #[test]
    fn env_count_must_match_config() {
        let mut env = silent_env(2);
        let result = Trainer::new(recording(), small_config(), &mut env);
        assert!(matches!(result, Err(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn reordered_agents_fail_the_update() {
        /// Swaps the agent order after the first step.
        struct Shuffler {
            inner: SyncVecEnv<Silent>,
            steps: usize,
        }

        impl VecMultiAgentEnv for Shuffler {
            fn num_envs(&self) -> usize {
                self.inner.num_envs()
            }
            fn single_observation_space(&self) -> &ObservationSpace {
                self.inner.single_observation_space()
            }
            fn single_action_space(&self) -> &ActionSpace {
                self.inner.single_action_space()
            }
            fn reset(&mut self) -> Result<AgentMap<Vec<f32>>> {
                self.inner.reset()
            }
            fn step(&mut self, actions: &[AgentMap<i64>]) -> Result<VecStepResult> {
                let mut result = self.inner.step(actions)?;
                self.steps += 1;
                if self.steps > 1 {
                    let mut entries: Vec<_> = result
                        .observations
                        .iter()
                        .map(|(a, v)| (a.clone(), v.clone()))
                        .collect();
                    entries.reverse();
                    result.observations = entries.into_iter().collect();
                }
                Ok(result)
            }
        }

        let mut env = Shuffler {
            inner: silent_env(1),
            steps: 0,
        };
        let mut trainer =
            Trainer::new(recording(), small_config(), &mut env).unwrap();
        let err = trainer
            .update(1, 4, &mut env, &mut MemorySink::new())
            .unwrap_err();
        assert!(matches!(err, TrainError::AgentOrderMismatch { .. }));
        assert!(trainer.learner().batches.is_empty());
    }

    #[test]
    fn action_head_must_match_discrete_space() {
        let mut env = silent_env(1);
        let learner = RecordingLearner {
            num_actions: 2,
            ..recording()
        };
        let result = Trainer::new(learner, small_config(), &mut env);
        assert!(matches!(result, Err(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn out_of_range_action_fails_before_stepping_env() {
        let mut env = silent_env(1);
        let learner = RecordingLearner {
            action: 7,
            ..recording()
        };
        let mut trainer = Trainer::new(learner, small_config(), &mut env).unwrap();

        let err = trainer
            .update(1, 4, &mut env, &mut MemorySink::new())
            .unwrap_err();
        assert!(matches!(
            err,
            TrainError::BatchSizeMismatch {
                what: "sampled action index",
                expected: 5,
                actual: 7
            }
        ));
        assert!(env.envs()[0].seen_actions.is_empty());
        assert!(trainer.learner().batches.is_empty());
    }

    #[test]
    fn n_step_returns_without_gae() {
        let mut env = rewarding_env(1, 1.0);
        let config = PpoConfig {
            gae: false,
            gamma: 0.5,
            ..small_config()
        };
        let mut trainer = Trainer::new(recording(), config, &mut env).unwrap();

        trainer.update(1, 4, &mut env, &mut MemorySink::new()).unwrap();

        // Zero bootstrap value, no episode boundary: discounted tail sums.
        let expected: [f32; 4] = [1.875, 1.75, 1.5, 1.0];
        for batch in &trainer.learner().batches {
            assert_eq!(batch.returns, expected);
            assert_eq!(batch.advantages, expected);
        }
    }

    #[test]
    fn recorded_learning_rate_comes_from_learner() {
        let mut env = silent_env(1);
        let config = PpoConfig {
            learning_rate: 1e-3,
            ..small_config()
        };
        let learner = RecordingLearner {
            lr_cap: Some(6e-4),
            ..recording()
        };
        let mut trainer = Trainer::new(learner, config, &mut env).unwrap();
        let mut sink = MemorySink::new();

        trainer.run(&mut env, &mut sink).unwrap();

        let recorded = sink.values(metrics::LEARNING_RATE);
        let expected = [6e-4, 6e-4, 5e-4, 2.5e-4];
        assert_eq!(recorded.len(), 4);
        for (lr, e) in recorded.iter().zip(expected) {
            assert!((lr - e).abs() < 1e-12);
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn update_report_serializes() {
        let mut env = silent_env(1);
        let mut trainer = Trainer::new(recording(), small_config(), &mut env).unwrap();
        let report = trainer.update(1, 4, &mut env, &mut MemorySink::new()).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["update"], 1);
        assert_eq!(json["rollout"]["steps"], 4);
        assert_eq!(json["agents"][1]["agent"], "agent-1");
    }
}
