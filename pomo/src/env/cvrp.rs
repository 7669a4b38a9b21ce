// src/env/cvrp.rs
//
// Capacitated vehicle routing environment.
//
// Features:
// - `locs`     (B, N, 2), node 0 is the depot
// - `demand`   (B, N, 1), depot demand is 0
// - `capacity` global (B, 1, 1)
//
// The vehicle starts at the depot. Visiting a customer consumes its demand;
// returning to the depot refills. A trajectory is done once every customer
// has been served, so trajectories terminate at different steps and are
// padded by the decoder afterwards. Reward is the negative route length,
// including the final return to the depot.

use ndarray::Array1;

use crate::batch::InstanceBatch;
use crate::env::{node_distance, Environment, TrajectoryState};
use crate::error::{PomoError, Result};

pub const CVRP_ENV_NAME: &str = "cvrp";
pub const USED_CAPACITY: &str = "used_capacity";

const DEPOT: usize = 0;
const CAPACITY_EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct CvrpEnv {
    name: String,
}

impl Default for CvrpEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl CvrpEnv {
    pub fn new() -> Self {
        Self {
            name: CVRP_ENV_NAME.to_string(),
        }
    }

    /// Same dynamics registered under another name (e.g. `sdvrp` adapters).
    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn refresh_mask(state: &mut TrajectoryState, row: usize) -> Result<()> {
        let demand = state.instance.require("demand")?;
        let capacity = state.instance.require("capacity")?[[row, 0, 0]];
        let used = state.scalar(USED_CAPACITY)?[row];
        let n = state.num_nodes();
        let at_depot = state
            .current_node
            .as_ref()
            .map_or(true, |cur| cur[row] == DEPOT);

        let mut unserved = 0usize;
        let mut customer_mask = vec![false; n];
        for j in 1..n {
            let served = state.visited[[row, j]];
            if !served {
                unserved += 1;
            }
            customer_mask[j] = served || used + demand[[row, j, 0]] > capacity + CAPACITY_EPS;
        }
        for (j, &m) in customer_mask.iter().enumerate().skip(1) {
            state.action_mask[[row, j]] = m;
        }
        // no depot-to-depot moves while work remains
        state.action_mask[[row, DEPOT]] = at_depot && unserved > 0;
        Ok(())
    }
}

impl Environment for CvrpEnv {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&self, batch: &InstanceBatch, num_starts: usize) -> Result<TrajectoryState> {
        let locs = batch.require("locs")?;
        if locs.dim().2 != 2 {
            return Err(PomoError::shape("cvrp locs feature dim", 2, locs.dim().2));
        }
        batch.require("demand")?;
        batch.require("capacity")?;
        if batch.num_nodes() < 2 {
            return Err(PomoError::config(
                "num_nodes",
                "cvrp needs a depot and at least one customer",
            ));
        }

        let mut state = TrajectoryState::new(batch, num_starts)?;
        let t = state.num_trajectories();
        state.current_node = Some(vec![DEPOT; t]);
        state.visited.column_mut(DEPOT).fill(true);
        state
            .scalars
            .insert(USED_CAPACITY.to_string(), Array1::zeros(t));
        for row in 0..t {
            Self::refresh_mask(&mut state, row)?;
        }
        Ok(state)
    }

    fn step(&self, state: &mut TrajectoryState, actions: &[usize]) -> Result<()> {
        let live: Vec<bool> = state.done.iter().map(|d| !d).collect();
        state.advance(actions)?;
        let n = state.num_nodes();
        for row in 0..state.num_trajectories() {
            if !live[row] {
                continue;
            }
            let a = actions[row];
            let delta = if a == DEPOT {
                None
            } else {
                Some(state.instance.require("demand")?[[row, a, 0]])
            };
            if let Some(used) = state.scalars.get_mut(USED_CAPACITY) {
                match delta {
                    None => used[row] = 0.0,
                    Some(d) => used[row] += d,
                }
            }
            state.visited[[row, a]] = true;
            if (1..n).all(|j| state.visited[[row, j]]) {
                state.done[row] = true;
                state.action_mask.row_mut(row).fill(true);
                continue;
            }
            Self::refresh_mask(state, row)?;
        }
        Ok(())
    }

    fn reward(&self, state: &TrajectoryState) -> Result<Array1<f32>> {
        let locs = state.instance.require("locs")?;
        let routes = state.action_sequences();
        let mut reward = Array1::zeros(state.num_trajectories());
        for (row, route) in routes.outer_iter().enumerate() {
            let mut length = 0.0;
            let mut prev = DEPOT;
            for &node in route.iter() {
                length += node_distance(locs, row, prev, node);
                prev = node;
            }
            length += node_distance(locs, row, prev, DEPOT);
            reward[row] = -length;
        }
        Ok(reward)
    }

    /// Replica `p` starts at customer `1 + p mod (N - 1)`.
    fn start_nodes(&self, state: &TrajectoryState, num_starts: usize) -> Result<Vec<usize>> {
        let customers = state.num_nodes().saturating_sub(1);
        if customers == 0 || num_starts == 0 {
            return Err(PomoError::config(
                "num_starts",
                "cvrp starts need at least one customer",
            ));
        }
        let b = state.batch_size();
        Ok((0..state.num_trajectories())
            .map(|row| 1 + (row / b) % customers)
            .collect())
    }

    /// Every customer plus at most one depot return per customer.
    fn step_limit(&self, state: &TrajectoryState) -> usize {
        2 * state.num_nodes()
    }
}
