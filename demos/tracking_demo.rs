//! Trains a shared policy on a toy grid tracking task.
//!
//! Two agents move on a bounded grid while two targets random-walk. Each
//! agent observes the offset to every target; the team is rewarded for
//! keeping every target close to some agent.
//!
//! Run with:
//!
//! ```text
//! cargo run --example tracking_demo --features nn
//! ```

use matt_ppo::agents::AgentMap;
use matt_ppo::env::{MultiAgentEnv, StepResult, SyncVecEnv};
use matt_ppo::metrics::TracingSink;
use matt_ppo::spaces::{ActionSpace, ObservationSpace};
use matt_ppo::training::TchLearner;
use matt_ppo::{PpoConfig, Result, TrainError, Trainer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tch::Device;

const GRID: i32 = 10;
const AGENTS: [&str; 2] = ["tracker-0", "tracker-1"];
const TARGETS: usize = 2;
const MOVES: [(i32, i32); 5] = [(0, 0), (1, 0), (-1, 0), (0, 1), (0, -1)];

struct GridTracking {
    space: ObservationSpace,
    actions: ActionSpace,
    agents: Vec<(i32, i32)>,
    targets: Vec<(i32, i32)>,
    rng: StdRng,
}

impl GridTracking {
    fn new(seed: u64) -> Self {
        Self {
            space: ObservationSpace::uniform(AGENTS, &[TARGETS, 2]),
            actions: ActionSpace::Discrete { n: MOVES.len() },
            agents: vec![(0, 0); AGENTS.len()],
            targets: vec![(0, 0); TARGETS],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn random_cell(&mut self) -> (i32, i32) {
        (self.rng.gen_range(0..GRID), self.rng.gen_range(0..GRID))
    }

    fn observations(&self) -> AgentMap<Vec<f32>> {
        AGENTS
            .iter()
            .zip(&self.agents)
            .map(|(id, (ax, ay))| {
                let obs: Vec<f32> = self
                    .targets
                    .iter()
                    .flat_map(|(tx, ty)| [(tx - ax) as f32 / GRID as f32, (ty - ay) as f32 / GRID as f32])
                    .collect();
                (*id, obs)
            })
            .collect()
    }

    fn shift(pos: (i32, i32), (dx, dy): (i32, i32)) -> (i32, i32) {
        ((pos.0 + dx).clamp(0, GRID - 1), (pos.1 + dy).clamp(0, GRID - 1))
    }
}

impl MultiAgentEnv for GridTracking {
    fn observation_space(&self) -> &ObservationSpace {
        &self.space
    }

    fn action_space(&self) -> &ActionSpace {
        &self.actions
    }

    fn reset(&mut self) -> Result<AgentMap<Vec<f32>>> {
        self.agents = (0..AGENTS.len()).map(|_| self.random_cell()).collect();
        self.targets = (0..TARGETS).map(|_| self.random_cell()).collect();
        Ok(self.observations())
    }

    fn step(&mut self, actions: &AgentMap<i64>) -> Result<StepResult> {
        for (pos, action) in self.agents.iter_mut().zip(actions.values()) {
            let m = usize::try_from(*action)
                .ok()
                .and_then(|i| MOVES.get(i))
                .ok_or_else(|| TrainError::Environment(format!("unknown move {action}")))?;
            *pos = Self::shift(*pos, *m);
        }
        for i in 0..self.targets.len() {
            let m = MOVES[self.rng.gen_range(0..MOVES.len())];
            self.targets[i] = Self::shift(self.targets[i], m);
        }

        let covered = self
            .targets
            .iter()
            .filter(|(tx, ty)| {
                self.agents
                    .iter()
                    .any(|(ax, ay)| (tx - ax).abs() + (ty - ay).abs() <= 1)
            })
            .count();

        Ok(StepResult {
            observations: self.observations(),
            reward: covered as f32 / TARGETS as f32,
            done: false,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = PpoConfig {
        total_timesteps: 50_000,
        num_envs: 4,
        ..PpoConfig::default()
    };

    let envs = (0..config.num_envs)
        .map(|i| GridTracking::new(config.seed + i as u64))
        .collect();
    let mut env = SyncVecEnv::new(envs)?;

    let obs_dim = TARGETS * 2;
    let learner = TchLearner::from_config(obs_dim, MOVES.len(), &config, Device::cuda_if_available())?;
    let mut trainer = Trainer::new(learner, config, &mut env)?;

    let summary = trainer.run(&mut env, &mut TracingSink)?;
    println!(
        "Finished {} updates, {} environment steps, {} episodes",
        summary.updates, summary.global_step, summary.episodes
    );
    Ok(())
}
