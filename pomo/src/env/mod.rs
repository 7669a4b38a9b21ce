// src/env/mod.rs
//
// Environment contract consumed by the rollout core.
//
// The decoder only knows this interface:
// - name(): selects embedding and context adapters
// - reset(batch, num_starts): tiled trajectory state with initial masks
// - step(state, actions): advance live trajectories, update mask / done
// - reward(state): final reward per trajectory
//
// Bundled implementations (TSP, CVRP) live in submodules together with
// seeded instance generators.

pub mod cvrp;
pub mod generator;
pub mod tsp;

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};

use crate::batch::InstanceBatch;
use crate::error::{PomoError, Result};

pub use cvrp::CvrpEnv;
pub use generator::{generate_cvrp, generate_tsp, vrp_capacity_for};
pub use tsp::TspEnv;

/// Mutable per-trajectory state for one rollout.
///
/// Rows are trajectories in block-major replica layout: row `p * B + b` is
/// start `p` of instance `b`.
#[derive(Debug, Clone)]
pub struct TrajectoryState {
    /// Instance batch tiled to one row per trajectory.
    pub instance: InstanceBatch,
    /// Replicas per instance (P).
    pub num_starts: usize,
    /// Completed decode steps.
    pub step: usize,
    /// Node each trajectory currently sits on (`None` before the first move
    /// for problems without a fixed start).
    pub current_node: Option<Vec<usize>>,
    /// First node chosen by each trajectory.
    pub first_node: Option<Vec<usize>>,
    pub visited: Array2<bool>,
    /// `true` = infeasible.
    pub action_mask: Array2<bool>,
    pub done: Vec<bool>,
    /// Step-major partial solutions: `actions[s][t]`.
    pub actions: Vec<Vec<usize>>,
    /// Named per-trajectory quantities (e.g. `used_capacity`).
    pub scalars: BTreeMap<String, Array1<f32>>,
    /// Set once the rollout has terminated.
    pub reward: Option<Array1<f32>>,
}

impl TrajectoryState {
    /// Fresh state for `batch` tiled `num_starts` times: nothing visited,
    /// nothing masked, nothing done.
    pub fn new(batch: &InstanceBatch, num_starts: usize) -> Result<Self> {
        let instance = batch.batchify(num_starts)?;
        let t = instance.batch_size();
        let n = instance.num_nodes();
        Ok(Self {
            instance,
            num_starts,
            step: 0,
            current_node: None,
            first_node: None,
            visited: Array2::from_elem((t, n), false),
            action_mask: Array2::from_elem((t, n), false),
            done: vec![false; t],
            actions: Vec::new(),
            scalars: BTreeMap::new(),
            reward: None,
        })
    }

    pub fn num_trajectories(&self) -> usize {
        self.done.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.visited.ncols()
    }

    /// Original (un-replicated) batch size.
    pub fn batch_size(&self) -> usize {
        self.num_trajectories() / self.num_starts.max(1)
    }

    pub fn all_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    pub fn is_live(&self, row: usize) -> bool {
        !self.done[row]
    }

    pub fn scalar(&self, name: &str) -> Result<&Array1<f32>> {
        self.scalars.get(name).ok_or_else(|| {
            PomoError::shape(
                "trajectory scalars",
                format!("a channel named '{name}'"),
                format!("{:?}", self.scalars.keys().collect::<Vec<_>>()),
            )
        })
    }

    /// Shared step bookkeeping: record actions, update first/current node,
    /// bump the step counter. Done rows keep their current node.
    pub fn advance(&mut self, actions: &[usize]) -> Result<()> {
        let t = self.num_trajectories();
        if actions.len() != t {
            return Err(PomoError::shape("step actions", t, actions.len()));
        }
        let n = self.num_nodes();
        if let Some(&bad) = actions.iter().find(|&&a| a >= n) {
            return Err(PomoError::shape("action index", format!("< {n}"), bad));
        }

        let current: Vec<usize> = match &self.current_node {
            Some(prev) => (0..t)
                .map(|row| if self.done[row] { prev[row] } else { actions[row] })
                .collect(),
            None => actions.to_vec(),
        };
        if self.first_node.is_none() {
            self.first_node = Some(actions.to_vec());
        }
        self.current_node = Some(current);
        self.actions.push(actions.to_vec());
        self.step += 1;
        Ok(())
    }

    /// Per-trajectory action sequences, `(T, steps)`.
    pub fn action_sequences(&self) -> Array2<usize> {
        let t = self.num_trajectories();
        let s = self.actions.len();
        Array2::from_shape_fn((t, s), |(row, step)| self.actions[step][row])
    }
}

/// Black-box environment collaborator.
pub trait Environment: Send + Sync {
    /// Identifier used to look up embedding and context adapters.
    fn name(&self) -> &str;

    /// Build the initial state for `num_starts` replicas of every instance.
    fn reset(&self, batch: &InstanceBatch, num_starts: usize) -> Result<TrajectoryState>;

    /// Apply one action per trajectory. Actions of done rows are ignored.
    fn step(&self, state: &mut TrajectoryState, actions: &[usize]) -> Result<()>;

    /// Reward per trajectory, read from a terminal state.
    fn reward(&self, state: &TrajectoryState) -> Result<Array1<f32>>;

    /// Forced first action per trajectory when `num_starts > 1`.
    ///
    /// Default: replica `p` starts at node `p mod N`.
    fn start_nodes(&self, state: &TrajectoryState, num_starts: usize) -> Result<Vec<usize>> {
        let n = state.num_nodes();
        let b = state.batch_size();
        if n == 0 || num_starts == 0 {
            return Err(PomoError::config("num_starts", "needs at least one node and one start"));
        }
        Ok((0..state.num_trajectories())
            .map(|row| (row / b) % n)
            .collect())
    }

    /// Decode steps after which a non-terminated rollout is a bug.
    fn step_limit(&self, state: &TrajectoryState) -> usize {
        state.num_nodes()
    }
}

/// Euclidean distance between nodes `i` and `j` of row `row` in a
/// (batch, node, 2) location tensor.
pub(crate) fn node_distance(locs: &ndarray::Array3<f32>, row: usize, i: usize, j: usize) -> f32 {
    let dx = locs[[row, i, 0]] - locs[[row, j, 0]];
    let dy = locs[[row, i, 1]] - locs[[row, j, 1]];
    (dx * dx + dy * dy).sqrt()
}
