// src/env/tsp.rs
//
// Travelling salesman environment.
//
// Features: `locs` (B, N, 2). A trajectory visits every node exactly once;
// it is done after N steps. Reward is the negative closed-tour length.

use ndarray::Array1;

use crate::batch::InstanceBatch;
use crate::env::{node_distance, Environment, TrajectoryState};
use crate::error::{PomoError, Result};

pub const TSP_ENV_NAME: &str = "tsp";

#[derive(Debug, Clone, Default)]
pub struct TspEnv;

impl TspEnv {
    pub fn new() -> Self {
        Self
    }
}

impl Environment for TspEnv {
    fn name(&self) -> &str {
        TSP_ENV_NAME
    }

    fn reset(&self, batch: &InstanceBatch, num_starts: usize) -> Result<TrajectoryState> {
        let locs = batch.require("locs")?;
        if locs.dim().2 != 2 {
            return Err(PomoError::shape("tsp locs feature dim", 2, locs.dim().2));
        }
        if batch.num_nodes() == 0 {
            return Err(PomoError::config("num_nodes", "tsp needs at least one node"));
        }
        TrajectoryState::new(batch, num_starts)
    }

    fn step(&self, state: &mut TrajectoryState, actions: &[usize]) -> Result<()> {
        state.advance(actions)?;
        let n = state.num_nodes();
        for row in 0..state.num_trajectories() {
            if state.done[row] {
                continue;
            }
            let a = actions[row];
            state.visited[[row, a]] = true;
            state.action_mask[[row, a]] = true;
            if (0..n).all(|j| state.visited[[row, j]]) {
                state.done[row] = true;
            }
        }
        Ok(())
    }

    fn reward(&self, state: &TrajectoryState) -> Result<Array1<f32>> {
        let locs = state.instance.require("locs")?;
        let tours = state.action_sequences();
        let n = state.num_nodes();
        let mut reward = Array1::zeros(state.num_trajectories());
        for (row, tour) in tours.outer_iter().enumerate() {
            if tour.len() < n {
                return Err(PomoError::shape("tsp tour length", n, tour.len()));
            }
            let tour: Vec<usize> = tour.iter().copied().take(n).collect();
            let mut length = 0.0;
            for w in tour.windows(2) {
                length += node_distance(locs, row, w[0], w[1]);
            }
            length += node_distance(locs, row, tour[n - 1], tour[0]);
            reward[row] = -length;
        }
        Ok(reward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn square() -> InstanceBatch {
        let locs: Array3<f32> = array![[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]];
        InstanceBatch::new("locs", locs)
    }

    #[test]
    fn test_tsp_tour_reward() {
        let env = TspEnv::new();
        let mut state = env.reset(&square(), 1).unwrap();
        for a in [0, 1, 2, 3] {
            assert!(!state.all_done());
            env.step(&mut state, &[a]).unwrap();
        }
        assert!(state.all_done());
        let r = env.reward(&state).unwrap();
        assert!((r[0] + 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_tsp_masks_visited() {
        let env = TspEnv::new();
        let mut state = env.reset(&square(), 2).unwrap();
        env.step(&mut state, &[0, 2]).unwrap();
        assert!(state.action_mask[[0, 0]]);
        assert!(!state.action_mask[[0, 2]]);
        assert!(state.action_mask[[1, 2]]);
    }

    #[test]
    fn test_tsp_default_start_nodes() {
        let env = TspEnv::new();
        let batch = InstanceBatch::new("locs", Array3::zeros((2, 3, 2)));
        let state = env.reset(&batch, 4).unwrap();
        let starts = env.start_nodes(&state, 4).unwrap();
        // replica p of every instance starts at p mod N
        assert_eq!(starts, vec![0, 0, 1, 1, 2, 2, 0, 0]);
    }

    #[test]
    fn test_tsp_rejects_wrong_feature_dim() {
        let env = TspEnv::new();
        let batch = InstanceBatch::new("locs", Array3::zeros((1, 3, 3)));
        assert!(env.reset(&batch, 1).is_err());
    }
}
